//! The light compiler: expression trees to interpreter instructions.

mod bytecode;
mod control;
mod error;
mod labels;
mod locals;


pub use bytecode::BytecodeCompiler;
pub use error::CompileError;
pub use labels::{LabelScopeKind, LabelScopes};
pub use locals::{LocalDefinition, LocalVariable, LocalVariables};
