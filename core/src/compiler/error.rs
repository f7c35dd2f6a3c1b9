//! Lowering errors.
//!
//! These describe trees the light compiler cannot lower, or internal
//! inconsistencies found while lowering. None of them is a user-program
//! exception; the engine reacts to most of them by compiling the lambda
//! with the native tier instead.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("variable '{name}' is not defined in any enclosing scope")]
    UnboundVariable { name: String },

    #[error("{node} left the operand stack at depth {actual}, expected {expected}")]
    StackDepth { node: String, expected: usize, actual: usize },

    #[error("instruction {index} pops from an empty operand stack")]
    StackUnderflow { index: usize },

    #[error("label {label} marked twice")]
    LabelAlreadyMarked { label: u32 },

    #[error("label {label} is referenced but never marked")]
    UnmarkedLabel { label: u32 },

    #[error("branch at {at} reaches its target with stack depth {actual}, label expects {expected}")]
    BranchDepthMismatch { at: usize, expected: usize, actual: usize },

    #[error("invalid jump: {0}")]
    InvalidJump(String),

    #[error("rethrow outside of a catch block")]
    RethrowOutsideCatch,

    #[error("too many local variables")]
    TooManyLocals,
}

impl CompileError {
    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        CompileError::Unsupported(what.into())
    }
}
