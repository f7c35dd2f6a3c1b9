//! Plain-text rendering of engine errors
//!
//! Runtime errors print the exception followed by the logical stack trace,
//! innermost frame first, the way a host would show an unhandled exception.

use crate::Error;
use std::io::Write;

const RED_BOLD: &str = "\x1b[1;31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Character set for rendering error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharSet {
    #[default]
    Unicode,
    Ascii,
}

/// Configuration for error rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderConfig {
    /// Whether to use ANSI color codes in output.
    pub color: bool,
    pub charset: CharSet,
}

/// Render an error to stderr with colors.
pub fn render_error(error: &Error) {
    let config = RenderConfig { color: true, ..Default::default() };
    render_error_to(error, &mut std::io::stderr(), &config).ok();
}

/// Render an error to a writer with the given configuration.
///
/// # Example
/// ```
/// use arbor::{Engine, RenderConfig, render_error_to};
/// use arbor::tree::{Expr, LambdaExpr, Variable};
/// use arbor::types::Type;
/// use arbor::values::Value;
///
/// let x = Variable::new("x", Type::Int);
/// let lambda = LambdaExpr::new("div", vec![x.clone()], Expr::divide(Expr::int(1), Expr::param(&x)));
/// let expr = Engine::default().compile(Default::default(), &lambda).unwrap();
///
/// let error = expr.run(Default::default(), &[Value::Int(0)]).unwrap_err();
/// let mut buf = Vec::new();
/// render_error_to(&error, &mut buf, &RenderConfig::default()).unwrap();
/// assert!(String::from_utf8_lossy(&buf).starts_with("Unhandled exception: DivideByZeroException"));
/// ```
pub fn render_error_to(error: &Error, writer: &mut dyn Write, config: &RenderConfig) -> std::io::Result<()> {
    let (header, reset) = if config.color { (RED_BOLD, RESET) } else { ("", "") };

    match error {
        Error::Runtime { fault, trace } => {
            let exception = fault.exception();
            let kind = if fault.is_abort() { "Aborted" } else { "Unhandled exception" };
            writeln!(writer, "{header}{kind}: {}{reset}: {}", exception.class().name(), exception.message())?;

            let bullet = match config.charset {
                CharSet::Unicode => "  └─",
                CharSet::Ascii => "  -",
            };
            let dim = if config.color { DIM } else { "" };
            for entry in trace {
                writeln!(writer, "{dim}{bullet}{reset} {entry}")?;
            }
            Ok(())
        }
        Error::Lowering(e) => writeln!(writer, "{header}Lowering failed{reset}: {}", e),
        Error::NativeCompile(e) => writeln!(writer, "{header}Native compilation failed{reset}: {}", e),
        Error::ResourceExceeded(msg) => writeln!(writer, "{header}Resource limit exceeded{reset}: {}", msg),
        Error::Api(msg) => writeln!(writer, "{header}API error{reset}: {}", msg),
    }
}

/// Render an error to a string without colors.
pub fn render_error_to_string(error: &Error, charset: CharSet) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = render_error_to(error, &mut buf, &RenderConfig { color: false, charset });
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::types::builtin;
    use arbor_core::values::TraceEntry;
    use arbor_core::vm::Fault;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn entry(function: &str, instruction: Option<usize>) -> TraceEntry {
        TraceEntry { function: Arc::from(function), instruction, lines: None, file: None }
    }

    #[test]
    fn test_runtime_error_with_trace() {
        let error = Error::Runtime {
            fault: Fault::new(&builtin::ARGUMENT, "bad input"),
            trace: vec![entry("inner", Some(4)), entry("outer", None)],
        };
        assert_eq!(
            render_error_to_string(&error, CharSet::Ascii),
            "Unhandled exception: ArgumentException: bad input\n  - at inner [ip 4]\n  - at outer\n"
        );
    }

    #[test]
    fn test_abort_and_plain_errors() {
        let error = Error::from(Fault::abort(arbor_core::values::Value::str("stop")));
        let rendered = render_error_to_string(&error, CharSet::Unicode);
        assert!(rendered.starts_with("Aborted: ExecutionAbortedException: stop"), "{}", rendered);

        let error = Error::Api("expected 1 arguments, got 0".to_string());
        assert_eq!(render_error_to_string(&error, CharSet::Unicode), "API error: expected 1 arguments, got 0\n");
    }

    #[test]
    fn test_color_codes() {
        let error = Error::ResourceExceeded("depth".to_string());
        let mut buf = Vec::new();
        render_error_to(&error, &mut buf, &RenderConfig { color: true, charset: CharSet::Ascii }).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "\x1b[1;31mResource limit exceeded\x1b[0m: depth\n");
    }
}
