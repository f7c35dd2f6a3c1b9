//! Instruction set of the interpreter.
//!
//! The interpreter is a stack machine. Each frame has one contiguous value
//! array: local slots first, then the operand stack. Every instruction has a
//! fixed contract of operands consumed and produced (`[..., a, b] -> [..., c]`
//! in the docs below), which the lowering compiler tracks to size frames and
//! check branch targets.
//!
//! Branch offsets are relative to the branch instruction. Gotos and handler
//! exits go through runtime labels instead, because they may have to run
//! `finally` blocks on the way.

use super::call_site::CallSite;
use crate::tiering::{DelegateCreator, LoopTier};
use crate::types::{Class, Method, Type};
use crate::values::Value;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl ComparisonOp {
    pub fn eval<T: PartialOrd>(self, a: &T, b: &T) -> bool {
        match self {
            ComparisonOp::Less => a < b,
            ComparisonOp::LessEqual => a <= b,
            ComparisonOp::Greater => a > b,
            ComparisonOp::GreaterEqual => a >= b,
            ComparisonOp::Equal => a == b,
            ComparisonOp::NotEqual => a != b,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    IntToFloat,
    /// Truncates toward zero; NaN and out-of-range values fail.
    FloatToInt,
    BoolToInt,
    ToStr,
}

/// How `InitializeLocal` fills its slot on scope entry.
#[derive(Clone, Debug)]
pub enum LocalInit {
    Value(Value),
    /// Fresh cell holding the value, for variables captured by closures.
    Boxed(Value),
    /// Parameters are filled by the caller; nothing to do.
    Parameter,
    /// Moves the caller-supplied argument into a fresh cell.
    ParameterBoxed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SwitchKey {
    Int(i64),
    Bool(bool),
    Str(Arc<str>),
}

impl SwitchKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(SwitchKey::Int(*i)),
            Value::Bool(b) => Some(SwitchKey::Bool(*b)),
            Value::Str(s) => Some(SwitchKey::Str(Arc::clone(s))),
            _ => None,
        }
    }
}

/// Case value to relative branch offset.
#[derive(Clone, Debug, Default)]
pub struct SwitchTable {
    pub cases: HashMap<SwitchKey, isize>,
}

#[derive(Clone)]
pub enum Instruction {
    Nop,

    // ========================================================================
    // Stack
    // ========================================================================
    /// `[...] -> [..., value]`
    Push(Value),
    /// `[..., a] -> [...]`
    Pop,
    /// `[..., a] -> [..., a, a]`
    Dup,

    // ========================================================================
    // Locals
    // ========================================================================
    /// `[...] -> [..., locals[i]]`
    LoadLocal(u32),
    /// `[...] -> [..., *locals[i]]` where the slot holds a cell.
    LoadLocalBoxed(u32),
    /// `[...] -> [..., *closure[i]]`
    LoadLocalFromClosure(u32),
    /// `[...] -> [..., closure[i]]` pushes the cell itself, for re-capture.
    LoadLocalFromClosureBoxed(u32),
    /// `[..., v] -> [..., v]` and `locals[i] = v`
    AssignLocal(u32),
    /// `[..., v] -> [...]` and `locals[i] = v`
    StoreLocal(u32),
    AssignLocalBoxed(u32),
    StoreLocalBoxed(u32),
    AssignLocalToClosure(u32),
    StoreLocalToClosure(u32),
    /// Resets a slot on scope entry.
    InitializeLocal { index: u32, init: LocalInit },

    // ========================================================================
    // Arithmetic and comparison
    // ========================================================================
    /// `[..., a, b] -> [..., a op b]` on ints. Division by zero faults.
    IntBinOp(ArithOp),
    FloatBinOp(ArithOp),
    /// `[..., a, b] -> [..., bool]`
    IntCmpOp(ComparisonOp),
    FloatCmpOp(ComparisonOp),
    StringCmpOp(ComparisonOp),
    /// `[..., a, b] -> [..., a ++ b]`
    StringConcat,
    /// Value equality of any two operands.
    Equal,
    NotEqual,
    NegInt,
    NegFloat,
    /// Boolean not.
    Not,
    /// Bitwise complement of an int.
    BitNot,
    /// `And` / `Or` / `Xor` of two ints or two bools.
    BitOp(BitOp),

    // ========================================================================
    // Control flow
    // ========================================================================
    /// Unconditional relative jump. `has_value` carries the top operand to
    /// the target; `has_result` only matters for stack accounting.
    Branch { offset: isize, has_result: bool, has_value: bool },
    /// `[..., cond] -> [...]`
    BranchTrue(isize),
    BranchFalse(isize),
    /// `[..., key] -> [...]` then jump through the table, or fall through.
    Switch(Arc<SwitchTable>),
    /// Jump to a runtime label, running pending `finally` blocks first.
    Goto { label: u32, has_result: bool, has_value: bool },

    // ========================================================================
    // Exception regions
    // ========================================================================
    /// Pushes the `finally` label as a continuation.
    EnterTryFinally { label: u32 },
    /// Start of a `finally` body: `[...] -> [..., pending continuation,
    /// pending value]`, pops one continuation.
    EnterFinally,
    /// End of a `finally` body: restores the pending continuation and
    /// resumes it.
    LeaveFinally,
    /// Start of a handler: `[..., body value?] -> [..., exception]`. The
    /// handler's runtime label follows it; the engine writes the exception
    /// into the slot this reserves.
    EnterExceptionHandler { has_value: bool },
    /// End of a catch body: continue at `label`.
    LeaveExceptionHandler { label: u32, has_value: bool },
    /// End of a fault body: `[..., exception] -> [...]` and keep unwinding.
    LeaveFault { has_value: bool },
    /// `[..., exception] -> [..., <unreachable>]`
    Throw,
    ThrowVoid,
    Rethrow,
    RethrowVoid,

    // ========================================================================
    // Loop tiering
    // ========================================================================
    /// Loop header. Empty until lowering finishes.
    EnterLoop(Option<Arc<LoopTier>>),

    // ========================================================================
    // Calls
    // ========================================================================
    /// `[..., receiver?, args...] -> [..., result?]`. With `write_back`,
    /// the final values of by-ref arguments follow the result, in parameter
    /// order.
    Call { method: Arc<Method>, virtual_dispatch: bool, write_back: bool },
    /// `[..., callee, args...] -> [..., result?]`
    Invoke { arg_count: u32, void: bool },
    /// `[..., args...] -> [..., result?]` through a cached call site.
    Dynamic { site: Arc<CallSite>, arg_count: u32, void: bool },
    /// `[..., cells...] -> [..., function]`
    CreateDelegate { creator: Arc<DelegateCreator>, captures: u32 },

    // ========================================================================
    // Objects and arrays
    // ========================================================================
    /// `[..., fields...] -> [..., object]`
    New { class: Arc<Class>, arg_count: u32 },
    /// `[..., object] -> [..., field]`
    LoadField(u32),
    /// `[..., object, value] -> [...]`
    StoreField(u32),
    /// `[..., items...] -> [..., array]`
    NewArray(u32),
    /// `[..., length] -> [..., array]` filled with the default value.
    NewArrayBounds(Value),
    /// `[..., array, index] -> [..., item]`
    LoadElement,
    /// `[..., array, index, value] -> [...]`
    StoreElement,
    ArrayLength,

    // ========================================================================
    // Types
    // ========================================================================
    TypeIs(Type),
    TypeAs(Type),
    /// Checked reference cast; faults with InvalidCastException.
    Cast(Type),
    Convert(Conversion),
}

impl Instruction {
    pub fn consumed_stack(&self) -> usize {
        use Instruction::*;
        match self {
            Nop | Push(_) | LoadLocal(_) | LoadLocalBoxed(_) | LoadLocalFromClosure(_)
            | LoadLocalFromClosureBoxed(_) | InitializeLocal { .. } | EnterTryFinally { .. }
            | EnterFinally | EnterLoop(_) => 0,
            Pop | Dup | AssignLocal(_) | StoreLocal(_) | AssignLocalBoxed(_) | StoreLocalBoxed(_)
            | AssignLocalToClosure(_) | StoreLocalToClosure(_) => 1,
            IntBinOp(_) | FloatBinOp(_) | IntCmpOp(_) | FloatCmpOp(_) | StringCmpOp(_) | StringConcat
            | Equal | NotEqual | BitOp(_) => 2,
            NegInt | NegFloat | Not | BitNot => 1,
            Branch { has_value, .. } | Goto { has_value, .. } => *has_value as usize,
            BranchTrue(_) | BranchFalse(_) | Switch(_) => 1,
            LeaveFinally => 2,
            EnterExceptionHandler { has_value } | LeaveExceptionHandler { has_value, .. } => {
                *has_value as usize
            }
            LeaveFault { .. } => 1,
            Throw | ThrowVoid | Rethrow | RethrowVoid => 1,
            Call { method, .. } => method.params().len() + method.has_receiver() as usize,
            Invoke { arg_count, .. } => *arg_count as usize + 1,
            Dynamic { arg_count, .. } => *arg_count as usize,
            CreateDelegate { captures, .. } => *captures as usize,
            New { arg_count, .. } => *arg_count as usize,
            LoadField(_) => 1,
            StoreField(_) => 2,
            NewArray(count) => *count as usize,
            NewArrayBounds(_) => 1,
            LoadElement => 2,
            StoreElement => 3,
            ArrayLength | TypeIs(_) | TypeAs(_) | Cast(_) | Convert(_) => 1,
        }
    }

    pub fn produced_stack(&self) -> usize {
        use Instruction::*;
        match self {
            Nop | Pop | StoreLocal(_) | StoreLocalBoxed(_) | StoreLocalToClosure(_)
            | InitializeLocal { .. } | EnterTryFinally { .. } | EnterLoop(_) => 0,
            Push(_) | LoadLocal(_) | LoadLocalBoxed(_) | LoadLocalFromClosure(_)
            | LoadLocalFromClosureBoxed(_) | AssignLocal(_) | AssignLocalBoxed(_)
            | AssignLocalToClosure(_) => 1,
            Dup => 2,
            IntBinOp(_) | FloatBinOp(_) | IntCmpOp(_) | FloatCmpOp(_) | StringCmpOp(_) | StringConcat
            | Equal | NotEqual | BitOp(_) | NegInt | NegFloat | Not | BitNot => 1,
            Branch { has_result, .. } | Goto { has_result, .. } => *has_result as usize,
            BranchTrue(_) | BranchFalse(_) | Switch(_) => 0,
            EnterFinally => 2,
            LeaveFinally => 0,
            EnterExceptionHandler { .. } => 1,
            LeaveExceptionHandler { has_value, .. } | LeaveFault { has_value } => *has_value as usize,
            Throw | Rethrow => 1,
            ThrowVoid | RethrowVoid => 0,
            Call { method, write_back, .. } => {
                let outputs = if *write_back { method.params().iter().filter(|p| p.by_ref).count() } else { 0 };
                !method.ret().is_void() as usize + outputs
            }
            Invoke { void, .. } | Dynamic { void, .. } => !*void as usize,
            CreateDelegate { .. } | New { .. } | LoadField(_) | NewArray(_) | NewArrayBounds(_)
            | LoadElement | ArrayLength | TypeIs(_) | TypeAs(_) | Cast(_) | Convert(_) => 1,
            StoreField(_) | StoreElement => 0,
        }
    }

    pub fn consumed_continuations(&self) -> usize {
        matches!(self, Instruction::EnterFinally) as usize
    }

    pub fn produced_continuations(&self) -> usize {
        matches!(self, Instruction::EnterTryFinally { .. }) as usize
    }

    /// The boxed form of a local access to slot `index`, if this is one.
    pub(crate) fn boxed(&self, index: u32) -> Option<Instruction> {
        use Instruction::*;
        match self {
            LoadLocal(i) if *i == index => Some(LoadLocalBoxed(index)),
            AssignLocal(i) if *i == index => Some(AssignLocalBoxed(index)),
            StoreLocal(i) if *i == index => Some(StoreLocalBoxed(index)),
            InitializeLocal { index: i, init } if *i == index => match init {
                LocalInit::Value(value) => {
                    Some(InitializeLocal { index, init: LocalInit::Boxed(value.clone()) })
                }
                LocalInit::Parameter => Some(InitializeLocal { index, init: LocalInit::ParameterBoxed }),
                LocalInit::Boxed(_) | LocalInit::ParameterBoxed => None,
            },
            _ => None,
        }
    }

    /// Patches the offset of a relative branch.
    pub(crate) fn set_branch_offset(&mut self, new_offset: isize) {
        match self {
            Instruction::Branch { offset, .. } => *offset = new_offset,
            Instruction::BranchTrue(offset) | Instruction::BranchFalse(offset) => *offset = new_offset,
            other => debug_assert!(false, "not a relative branch: {:?}", other),
        }
    }

    /// Relative branches ending a basic block backwards are abort poll
    /// points.
    #[inline]
    pub fn is_backward_branch(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { offset, .. } | Instruction::BranchTrue(offset) | Instruction::BranchFalse(offset)
                if *offset <= 0
        )
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            Nop => write!(f, "Nop"),
            Push(value) => write!(f, "Push({:?})", value),
            Pop => write!(f, "Pop"),
            Dup => write!(f, "Dup"),
            LoadLocal(i) => write!(f, "LoadLocal({})", i),
            LoadLocalBoxed(i) => write!(f, "LoadLocalBoxed({})", i),
            LoadLocalFromClosure(i) => write!(f, "LoadLocalFromClosure({})", i),
            LoadLocalFromClosureBoxed(i) => write!(f, "LoadLocalFromClosureBoxed({})", i),
            AssignLocal(i) => write!(f, "AssignLocal({})", i),
            StoreLocal(i) => write!(f, "StoreLocal({})", i),
            AssignLocalBoxed(i) => write!(f, "AssignLocalBoxed({})", i),
            StoreLocalBoxed(i) => write!(f, "StoreLocalBoxed({})", i),
            AssignLocalToClosure(i) => write!(f, "AssignLocalToClosure({})", i),
            StoreLocalToClosure(i) => write!(f, "StoreLocalToClosure({})", i),
            InitializeLocal { index, init } => write!(f, "InitializeLocal({}, {:?})", index, init),
            IntBinOp(op) => write!(f, "IntBinOp({:?})", op),
            FloatBinOp(op) => write!(f, "FloatBinOp({:?})", op),
            IntCmpOp(op) => write!(f, "IntCmpOp({:?})", op),
            FloatCmpOp(op) => write!(f, "FloatCmpOp({:?})", op),
            StringCmpOp(op) => write!(f, "StringCmpOp({:?})", op),
            StringConcat => write!(f, "StringConcat"),
            Equal => write!(f, "Equal"),
            NotEqual => write!(f, "NotEqual"),
            NegInt => write!(f, "NegInt"),
            NegFloat => write!(f, "NegFloat"),
            Not => write!(f, "Not"),
            BitNot => write!(f, "BitNot"),
            BitOp(op) => write!(f, "BitOp({:?})", op),
            Branch { offset, has_result, has_value } => {
                write!(f, "Branch({:+}, result={}, value={})", offset, has_result, has_value)
            }
            BranchTrue(offset) => write!(f, "BranchTrue({:+})", offset),
            BranchFalse(offset) => write!(f, "BranchFalse({:+})", offset),
            Switch(table) => write!(f, "Switch({} cases)", table.cases.len()),
            Goto { label, has_result, has_value } => {
                write!(f, "Goto(L{}, result={}, value={})", label, has_result, has_value)
            }
            EnterTryFinally { label } => write!(f, "EnterTryFinally(L{})", label),
            EnterFinally => write!(f, "EnterFinally"),
            LeaveFinally => write!(f, "LeaveFinally"),
            EnterExceptionHandler { has_value } => write!(f, "EnterExceptionHandler(value={})", has_value),
            LeaveExceptionHandler { label, has_value } => {
                write!(f, "LeaveExceptionHandler(L{}, value={})", label, has_value)
            }
            LeaveFault { has_value } => write!(f, "LeaveFault(value={})", has_value),
            Throw => write!(f, "Throw"),
            ThrowVoid => write!(f, "ThrowVoid"),
            Rethrow => write!(f, "Rethrow"),
            RethrowVoid => write!(f, "RethrowVoid"),
            EnterLoop(tier) => write!(f, "EnterLoop({})", if tier.is_some() { "tiered" } else { "-" }),
            Call { method, virtual_dispatch, write_back } => {
                write!(
                    f,
                    "Call({}{}{})",
                    method.name(),
                    if *virtual_dispatch { ", virtual" } else { "" },
                    if *write_back { ", write-back" } else { "" }
                )
            }
            Invoke { arg_count, void } => write!(f, "Invoke({}, void={})", arg_count, void),
            Dynamic { site, arg_count, .. } => write!(f, "Dynamic({}, {})", site.name(), arg_count),
            CreateDelegate { creator, captures } => {
                write!(f, "CreateDelegate({}, captures={})", creator.name(), captures)
            }
            New { class, arg_count } => write!(f, "New({}, {})", class.name(), arg_count),
            LoadField(i) => write!(f, "LoadField({})", i),
            StoreField(i) => write!(f, "StoreField({})", i),
            NewArray(n) => write!(f, "NewArray({})", n),
            NewArrayBounds(default) => write!(f, "NewArrayBounds({:?})", default),
            LoadElement => write!(f, "LoadElement"),
            StoreElement => write!(f, "StoreElement"),
            ArrayLength => write!(f, "ArrayLength"),
            TypeIs(ty) => write!(f, "TypeIs({})", ty),
            TypeAs(ty) => write!(f, "TypeAs({})", ty),
            Cast(ty) => write!(f, "Cast({})", ty),
            Convert(conversion) => write!(f, "Convert({:?})", conversion),
        }
    }
}

static_assertions::assert_impl_all!(Instruction: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boxed_rewrites_only_matching_slot() {
        assert!(matches!(Instruction::LoadLocal(2).boxed(2), Some(Instruction::LoadLocalBoxed(2))));
        assert!(Instruction::LoadLocal(1).boxed(2).is_none());
        assert!(Instruction::LoadLocalBoxed(2).boxed(2).is_none());
        let init = Instruction::InitializeLocal { index: 0, init: LocalInit::Value(Value::Int(0)) };
        assert!(matches!(
            init.boxed(0),
            Some(Instruction::InitializeLocal { init: LocalInit::Boxed(Value::Int(0)), .. })
        ));
    }

    #[test]
    fn test_boxing_preserves_stack_contract() {
        for instruction in [Instruction::LoadLocal(0), Instruction::AssignLocal(0), Instruction::StoreLocal(0)] {
            let boxed = instruction.boxed(0);
            assert!(boxed.is_some());
            if let Some(boxed) = boxed {
                assert_eq!(boxed.consumed_stack(), instruction.consumed_stack());
                assert_eq!(boxed.produced_stack(), instruction.produced_stack());
            }
        }
    }

    #[test]
    fn test_finally_contract() {
        assert_eq!(Instruction::EnterTryFinally { label: 0 }.produced_continuations(), 1);
        assert_eq!(Instruction::EnterFinally.consumed_continuations(), 1);
        assert_eq!(Instruction::EnterFinally.produced_stack(), 2);
        assert_eq!(Instruction::LeaveFinally.consumed_stack(), 2);
    }
}
