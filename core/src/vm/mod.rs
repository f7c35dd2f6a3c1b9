mod call_site;
mod code;
mod context;
mod fault;
mod frame;
mod instruction_list;
mod instruction_set;
mod vm;

pub use call_site::{CallSite, CallSiteBinder};
pub use code::{Code, DebugInfo, ExceptionHandler, RETHROW_ON_RETURN, RuntimeLabel};
pub use context::{AbortHandle, DEFAULT_MAX_DEPTH, ExecutionContext};
pub use fault::Fault;
pub use frame::Frame;
pub use instruction_list::{BranchLabel, InstructionArray, InstructionList};
pub use instruction_set::{
    ArithOp, BitOp, ComparisonOp, Conversion, Instruction, LocalInit, SwitchKey, SwitchTable,
};
pub use vm::VM;

pub(crate) use vm::{bit_op, convert, float_arith, int_arith, mismatch};
