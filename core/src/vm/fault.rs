use crate::types::{ExceptionClass, builtin};
use crate::values::{ExceptionObject, ExceptionRef, Value};
use std::sync::Arc;

/// A fault unwinding through interpreted and compiled frames.
///
/// The exception object travels by `Arc`: catching and rethrowing never
/// copies it, so identity and the captured stack trace survive.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Fault {
    #[error("{}: {}", .0.class().name(), .0.message())]
    Exception(ExceptionRef),
    /// Raised when the host requests an abort. Catch handlers may observe
    /// it, but leaving the handler re-raises it.
    #[error("execution aborted: {}", .0.message())]
    Abort(ExceptionRef),
}

impl Fault {
    pub fn new(class: &Arc<ExceptionClass>, message: impl Into<String>) -> Self {
        Self::from_exception(ExceptionObject::new(class, message))
    }

    /// Wraps an exception object, classifying aborts by class.
    pub fn from_exception(exception: ExceptionRef) -> Self {
        if exception.class().is_abort() { Fault::Abort(exception) } else { Fault::Exception(exception) }
    }

    /// Faults from a thrown value. Throwing something that is not an
    /// exception is itself an invalid cast.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Exception(exception) => Self::from_exception(exception),
            Value::Null => Self::null_reference("throw of a null exception"),
            other => Self::invalid_cast(other.type_name(), "exception"),
        }
    }

    pub fn exception(&self) -> &ExceptionRef {
        match self {
            Fault::Exception(e) | Fault::Abort(e) => e,
        }
    }

    pub fn into_exception(self) -> ExceptionRef {
        match self {
            Fault::Exception(e) | Fault::Abort(e) => e,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Fault::Abort(_))
    }

    pub fn class(&self) -> &Arc<ExceptionClass> {
        self.exception().class()
    }

    pub fn divide_by_zero() -> Self {
        Self::new(&builtin::DIVIDE_BY_ZERO, "attempted to divide by zero")
    }

    pub fn invalid_cast(from: &str, to: &str) -> Self {
        Self::new(&builtin::INVALID_CAST, format!("cannot cast {} to {}", from, to))
    }

    pub fn null_reference(what: &str) -> Self {
        Self::new(&builtin::NULL_REFERENCE, what.to_string())
    }

    pub fn index_out_of_range(index: i64, len: usize) -> Self {
        Self::new(&builtin::INDEX_OUT_OF_RANGE, format!("index {} out of range for length {}", index, len))
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(&builtin::ARGUMENT, message)
    }

    pub fn missing_member(message: impl Into<String>) -> Self {
        Self::new(&builtin::MISSING_MEMBER, message)
    }

    pub fn insufficient_stack(depth: usize) -> Self {
        Self::new(
            &builtin::INSUFFICIENT_EXECUTION_STACK,
            format!("maximum call depth of {} exceeded", depth),
        )
    }

    /// Broken runtime invariant surfaced as an ordinary exception.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(&builtin::EXCEPTION, message)
    }

    pub fn abort(reason: Value) -> Self {
        let message = match &reason {
            Value::Str(s) => s.to_string(),
            Value::Null => "abort requested".to_string(),
            other => format!("{:?}", other),
        };
        Fault::Abort(ExceptionObject::with_payload(&builtin::EXECUTION_ABORTED, message, reason))
    }
}

impl From<ExceptionRef> for Fault {
    fn from(exception: ExceptionRef) -> Self {
        Self::from_exception(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let fault = Fault::divide_by_zero();
        assert_eq!(fault.to_string(), "DivideByZeroException: attempted to divide by zero");
        let abort = Fault::abort(Value::str("shutdown"));
        assert_eq!(abort.to_string(), "execution aborted: shutdown");
        assert!(abort.is_abort());
    }

    #[test]
    fn test_throwing_a_non_exception_is_a_cast_error() {
        let fault = Fault::from_value(Value::Int(3));
        assert_eq!(fault.class().name(), "InvalidCastException");
    }

    #[test]
    fn test_abort_classified_by_class() {
        let exception = ExceptionObject::new(&builtin::EXECUTION_ABORTED, "x");
        assert!(Fault::from_exception(exception).is_abort());
    }
}
