//! Growable instruction stream with stack-depth tracking and forward branch
//! fixups.

use super::code::{RETHROW_ON_RETURN, RuntimeLabel};
use super::instruction_set::Instruction;
use crate::compiler::CompileError;
use smallvec::SmallVec;

/// Handle to a label of an [`InstructionList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BranchLabel(u32);

#[derive(Clone, Copy, Debug)]
struct Fixup {
    /// Index of the branch instruction.
    at: usize,
    /// Operand depth the branch leaves for its target.
    depth: usize,
}

#[derive(Debug, Default)]
struct LabelSlot {
    target: Option<usize>,
    stack_depth: usize,
    continuation_depth: usize,
    runtime_index: Option<u32>,
    fixups: SmallVec<[Fixup; 4]>,
}

/// Finalized stream.
pub struct InstructionArray {
    pub instructions: Box<[Instruction]>,
    /// Runtime labels; the last one is the rethrow label.
    pub labels: Box<[RuntimeLabel]>,
    pub max_stack_depth: usize,
    pub max_continuation_depth: usize,
}

#[derive(Default)]
pub struct InstructionList {
    instructions: Vec<Instruction>,
    labels: Vec<LabelSlot>,
    runtime_labels: Vec<BranchLabel>,
    current_stack_depth: usize,
    max_stack_depth: usize,
    current_continuation_depth: usize,
    max_continuation_depth: usize,
    /// First instruction whose emission underflowed the operand stack.
    underflow: Option<usize>,
}

impl InstructionList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn current_stack_depth(&self) -> usize {
        self.current_stack_depth
    }

    #[inline]
    pub fn current_continuation_depth(&self) -> usize {
        self.current_continuation_depth
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Appends an instruction and returns its index.
    pub fn emit(&mut self, instruction: Instruction) -> usize {
        let index = self.instructions.len();
        self.update_depths(&instruction, index);
        self.instructions.push(instruction);
        index
    }

    fn update_depths(&mut self, instruction: &Instruction, index: usize) {
        let consumed = instruction.consumed_stack();
        if consumed > self.current_stack_depth && self.underflow.is_none() {
            self.underflow = Some(index);
        }
        self.current_stack_depth = self.current_stack_depth.saturating_sub(consumed) + instruction.produced_stack();
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);

        self.current_continuation_depth = self
            .current_continuation_depth
            .saturating_sub(instruction.consumed_continuations())
            + instruction.produced_continuations();
        self.max_continuation_depth = self.max_continuation_depth.max(self.current_continuation_depth);
    }

    /// Replaces an instruction in place. The replacement must have the same
    /// stack contract.
    pub fn replace(&mut self, index: usize, instruction: Instruction) {
        debug_assert_eq!(self.instructions[index].consumed_stack(), instruction.consumed_stack());
        debug_assert_eq!(self.instructions[index].produced_stack(), instruction.produced_stack());
        self.instructions[index] = instruction;
    }

    /// Rewrites the instruction at `at` to its boxed form if it accesses
    /// local slot `index`.
    pub fn switch_to_boxed(&mut self, index: u32, at: usize) {
        if let Some(boxed) = self.instructions.get(at).and_then(|i| i.boxed(index)) {
            self.instructions[at] = boxed;
        }
    }

    // ========================================================================
    // Labels
    // ========================================================================

    pub fn make_label(&mut self) -> BranchLabel {
        self.labels.push(LabelSlot::default());
        BranchLabel((self.labels.len() - 1) as u32)
    }

    pub fn label_target(&self, label: BranchLabel) -> Option<usize> {
        self.labels[label.0 as usize].target
    }

    /// Binds the label to the next instruction and resolves its fixups.
    pub fn mark_label(&mut self, label: BranchLabel) -> Result<(), CompileError> {
        let target = self.instructions.len();
        let stack_depth = self.current_stack_depth;
        let continuation_depth = self.current_continuation_depth;
        let slot = &mut self.labels[label.0 as usize];
        if slot.target.is_some() {
            return Err(CompileError::LabelAlreadyMarked { label: label.0 });
        }
        slot.target = Some(target);
        slot.stack_depth = stack_depth;
        slot.continuation_depth = continuation_depth;
        let fixups = std::mem::take(&mut slot.fixups);
        for fixup in fixups {
            self.fix_up(label, fixup)?;
        }
        Ok(())
    }

    /// Makes and marks a label that gotos and handlers can reach at run
    /// time. Returns its runtime index.
    pub fn mark_runtime_label(&mut self) -> Result<u32, CompileError> {
        let label = self.make_label();
        self.mark_label(label)?;
        Ok(self.ensure_label_index(label))
    }

    pub fn ensure_label_index(&mut self, label: BranchLabel) -> u32 {
        if let Some(index) = self.labels[label.0 as usize].runtime_index {
            return index;
        }
        let index = self.runtime_labels.len() as u32;
        self.runtime_labels.push(label);
        self.labels[label.0 as usize].runtime_index = Some(index);
        index
    }

    fn fix_up(&mut self, label: BranchLabel, fixup: Fixup) -> Result<(), CompileError> {
        let slot = &self.labels[label.0 as usize];
        let Some(target) = slot.target else {
            self.labels[label.0 as usize].fixups.push(fixup);
            return Ok(());
        };
        if fixup.depth != slot.stack_depth {
            return Err(CompileError::BranchDepthMismatch {
                at: fixup.at,
                expected: slot.stack_depth,
                actual: fixup.depth,
            });
        }
        let offset = target as isize - fixup.at as isize;
        self.instructions[fixup.at].set_branch_offset(offset);
        Ok(())
    }

    fn emit_relative_branch(&mut self, label: BranchLabel, instruction: Instruction, carried: usize) -> Result<(), CompileError> {
        let depth = self.current_stack_depth.saturating_sub(instruction.consumed_stack()) + carried;
        let at = self.emit(instruction);
        self.fix_up(label, Fixup { at, depth })
    }

    pub fn emit_branch(&mut self, label: BranchLabel, has_result: bool, has_value: bool) -> Result<(), CompileError> {
        self.emit_relative_branch(label, Instruction::Branch { offset: 0, has_result, has_value }, has_value as usize)
    }

    pub fn emit_branch_true(&mut self, label: BranchLabel) -> Result<(), CompileError> {
        self.emit_relative_branch(label, Instruction::BranchTrue(0), 0)
    }

    pub fn emit_branch_false(&mut self, label: BranchLabel) -> Result<(), CompileError> {
        self.emit_relative_branch(label, Instruction::BranchFalse(0), 0)
    }

    pub fn emit_goto(&mut self, label: BranchLabel, has_result: bool, has_value: bool) {
        let label = self.ensure_label_index(label);
        self.emit(Instruction::Goto { label, has_result, has_value });
    }

    pub fn emit_enter_try_finally(&mut self, finally: BranchLabel) {
        let label = self.ensure_label_index(finally);
        self.emit(Instruction::EnterTryFinally { label });
    }

    pub fn emit_leave_exception_handler(&mut self, has_value: bool, target: BranchLabel) {
        let label = self.ensure_label_index(target);
        self.emit(Instruction::LeaveExceptionHandler { label, has_value });
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Checks the stream and freezes it.
    pub fn finalize(self) -> Result<InstructionArray, CompileError> {
        if let Some(index) = self.underflow {
            return Err(CompileError::StackUnderflow { index });
        }
        for (i, slot) in self.labels.iter().enumerate() {
            if slot.target.is_none() && (!slot.fixups.is_empty() || slot.runtime_index.is_some()) {
                return Err(CompileError::UnmarkedLabel { label: i as u32 });
            }
        }

        // Single forward pass over the final stream; rewrites since
        // emission must not have changed any stack contract.
        let mut depth = 0usize;
        let mut max_stack_depth = 0usize;
        let mut continuations = 0usize;
        let mut max_continuation_depth = 0usize;
        for (index, instruction) in self.instructions.iter().enumerate() {
            depth = depth
                .checked_sub(instruction.consumed_stack())
                .ok_or(CompileError::StackUnderflow { index })?
                + instruction.produced_stack();
            max_stack_depth = max_stack_depth.max(depth);
            continuations = continuations
                .checked_sub(instruction.consumed_continuations())
                .ok_or(CompileError::StackUnderflow { index })?
                + instruction.produced_continuations();
            max_continuation_depth = max_continuation_depth.max(continuations);
        }
        debug_assert_eq!(max_stack_depth, self.max_stack_depth);

        let mut labels: Vec<RuntimeLabel> = Vec::with_capacity(self.runtime_labels.len() + 1);
        for label in &self.runtime_labels {
            let slot = &self.labels[label.0 as usize];
            labels.push(RuntimeLabel {
                index: slot.target.unwrap_or(RETHROW_ON_RETURN),
                stack_depth: slot.stack_depth,
                continuation_depth: slot.continuation_depth,
            });
        }
        labels.push(RuntimeLabel { index: RETHROW_ON_RETURN, stack_depth: 0, continuation_depth: 0 });

        Ok(InstructionArray {
            instructions: self.instructions.into_boxed_slice(),
            labels: labels.into_boxed_slice(),
            max_stack_depth,
            max_continuation_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_depth_tracking() {
        let mut list = InstructionList::new();
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit(Instruction::Push(Value::Int(2)));
        assert_eq!(list.current_stack_depth(), 2);
        list.emit(Instruction::IntBinOp(crate::vm::ArithOp::Add));
        assert_eq!(list.current_stack_depth(), 1);
        assert_eq!(list.max_stack_depth(), 2);
        let array = list.finalize();
        assert!(matches!(array, Ok(ref a) if a.max_stack_depth == 2 && a.labels.len() == 1));
    }

    #[test]
    fn test_underflow_is_a_finalize_error() {
        let mut list = InstructionList::new();
        list.emit(Instruction::Pop);
        assert!(matches!(list.finalize(), Err(CompileError::StackUnderflow { index: 0 })));
    }

    #[test]
    fn test_forward_branch_is_patched_on_mark() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let end = list.make_label();
        list.emit(Instruction::Push(Value::Bool(true)));
        list.emit_branch_false(end)?;
        list.emit(Instruction::Nop);
        list.emit(Instruction::Nop);
        list.mark_label(end)?;
        assert!(matches!(list.get(1), Some(Instruction::BranchFalse(3))));
        Ok(())
    }

    #[test]
    fn test_backward_branch_is_patched_immediately() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let top = list.make_label();
        list.mark_label(top)?;
        list.emit(Instruction::Nop);
        list.emit_branch(top, false, false)?;
        assert!(matches!(list.get(1), Some(Instruction::Branch { offset: -1, .. })));
        Ok(())
    }

    #[test]
    fn test_label_marked_twice() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let label = list.make_label();
        list.mark_label(label)?;
        assert!(matches!(list.mark_label(label), Err(CompileError::LabelAlreadyMarked { .. })));
        Ok(())
    }

    #[test]
    fn test_unmarked_label_fails_finalize() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let label = list.make_label();
        list.emit_branch(label, false, false)?;
        assert!(matches!(list.finalize(), Err(CompileError::UnmarkedLabel { .. })));
        Ok(())
    }

    #[test]
    fn test_branch_depth_mismatch() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let label = list.make_label();
        list.emit_branch(label, false, false)?;
        list.emit(Instruction::Push(Value::Int(1)));
        let result = list.mark_label(label);
        assert!(matches!(result, Err(CompileError::BranchDepthMismatch { expected: 1, actual: 0, .. })));
        Ok(())
    }

    #[test]
    fn test_runtime_labels_end_with_rethrow() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        list.emit(Instruction::Nop);
        let index = list.mark_runtime_label()?;
        list.emit(Instruction::Nop);
        let array = list.finalize()?;
        assert_eq!(index, 0);
        assert_eq!(array.labels[0], RuntimeLabel { index: 1, stack_depth: 0, continuation_depth: 0 });
        assert_eq!(array.labels[1].index, RETHROW_ON_RETURN);
        Ok(())
    }
}
