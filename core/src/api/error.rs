//! Public error type.
//!
//! Internal errors (lowering, native compilation, faults) are converted to
//! [`Error`] at the API boundary.

use crate::compiler::CompileError;
use crate::tiering::NativeCompileError;
use crate::types::builtin;
use crate::values::TraceEntry;
use crate::vm::Fault;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid API usage, such as a wrong argument count.
    #[error("API error: {0}")]
    Api(String),

    /// The tree could not be lowered to instructions.
    #[error("lowering failed: {0}")]
    Lowering(#[from] CompileError),

    /// The native tier rejected the tree.
    #[error("native compilation failed: {0}")]
    NativeCompile(#[from] NativeCompileError),

    /// The program raised an exception nobody caught.
    #[error("runtime error: {fault}")]
    Runtime { fault: Fault, trace: Vec<TraceEntry> },

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
}

impl Error {
    /// The uncaught fault, for runtime errors.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Runtime { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        let exception = fault.exception();
        if builtin::INSUFFICIENT_EXECUTION_STACK.is_assignable_from(exception.class()) {
            return Error::ResourceExceeded(exception.message().to_string());
        }
        let trace = exception.stack_trace().unwrap_or_default();
        Error::Runtime { fault, trace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_exhaustion_is_a_resource_error() {
        let error = Error::from(Fault::insufficient_stack(3));
        assert!(matches!(error, Error::ResourceExceeded(_)));

        let error = Error::from(Fault::divide_by_zero());
        assert!(error.fault().is_some_and(|f| f.class().name() == "DivideByZeroException"));
    }
}
