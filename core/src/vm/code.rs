//! The immutable product of lowering one lambda.

use super::instruction_set::Instruction;
use crate::tree::{LabelTarget, Variable};
use crate::types::ExceptionClass;
use crate::values::TraceEntry;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

/// Instruction index of the synthetic label that ends a frame by
/// rethrowing its pending fault. Far outside any instruction array.
pub const RETHROW_ON_RETURN: usize = isize::MAX as usize;

/// Resolved label: where to continue, with which operand-stack depth and
/// how many `finally` continuations still pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeLabel {
    pub index: usize,
    pub stack_depth: usize,
    pub continuation_depth: usize,
}

/// One entry of the handler table.
#[derive(Clone, Debug)]
pub struct ExceptionHandler {
    /// Protected region `[start, end)`.
    pub start: usize,
    pub end: usize,
    /// Runtime label the handler is entered through.
    pub label_index: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    /// `None` marks a fault handler, which matches everything.
    pub class: Option<Arc<ExceptionClass>>,
}

impl ExceptionHandler {
    pub fn is_fault(&self) -> bool {
        self.class.is_none()
    }

    #[inline]
    pub fn covers(&self, index: usize) -> bool {
        self.start <= index && index < self.end
    }

    pub fn is_inside_handler(&self, index: usize) -> bool {
        self.handler_start <= index && index < self.handler_end
    }

    pub fn matches(&self, thrown: &ExceptionClass, index: usize) -> bool {
        self.covers(index)
            && match &self.class {
                Some(class) => class.is_assignable_from(thrown),
                None => true,
            }
    }

    /// Narrowest region wins; identical regions prefer the handler that
    /// appears first.
    pub fn is_better_than(&self, other: Option<&ExceptionHandler>) -> bool {
        let Some(other) = other else {
            return true;
        };
        if self.start == other.start && self.end == other.end {
            return self.handler_start < other.handler_start;
        }
        self.start >= other.start && self.end <= other.end
    }
}

/// Maps an instruction index to source lines.
#[derive(Clone, Debug, PartialEq)]
pub struct DebugInfo {
    pub index: usize,
    pub start_line: u32,
    pub end_line: u32,
    pub file: Option<Arc<str>>,
    pub is_clear: bool,
}

impl DebugInfo {
    /// The last debug info at or before `index`. Infos are sorted by index.
    pub fn lookup(infos: &[DebugInfo], index: usize) -> Option<&DebugInfo> {
        let position = infos.partition_point(|info| info.index <= index);
        let info = infos.get(position.checked_sub(1)?)?;
        (!info.is_clear).then_some(info)
    }
}

/// Lowered lambda: instructions plus every table the engine needs.
pub struct Code {
    pub(crate) name: Arc<str>,
    pub(crate) instructions: Box<[Instruction]>,
    pub(crate) labels: Box<[RuntimeLabel]>,
    pub(crate) handlers: Box<[ExceptionHandler]>,
    pub(crate) debug_infos: Box<[DebugInfo]>,
    pub(crate) label_mapping: HashMap<LabelTarget, usize>,
    pub(crate) closure_variables: Vec<Variable>,
    pub(crate) arity: usize,
    pub(crate) num_locals: usize,
    pub(crate) max_stack_size: usize,
    pub(crate) max_continuation_depth: usize,
    pub(crate) compilation_threshold: i32,
    pub(crate) force_compile: bool,
    pub(crate) returns_value: bool,
}

impl Code {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn labels(&self) -> &[RuntimeLabel] {
        &self.labels
    }

    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    pub fn debug_infos(&self) -> &[DebugInfo] {
        &self.debug_infos
    }

    pub fn closure_variables(&self) -> &[Variable] {
        &self.closure_variables
    }

    /// Runtime label index of a tree label, if any goto targets it.
    pub fn label_index(&self, target: &LabelTarget) -> Option<usize> {
        self.label_mapping.get(target).copied()
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    pub fn max_continuation_depth(&self) -> usize {
        self.max_continuation_depth
    }

    pub fn compilation_threshold(&self) -> i32 {
        self.compilation_threshold
    }

    pub fn force_compile(&self) -> bool {
        self.force_compile
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    /// The label used to leave a frame with its pending fault.
    pub fn rethrow_label(&self) -> usize {
        self.labels.len() - 1
    }

    /// Best handler for a fault of class `thrown` raised at `index`, with
    /// its position in the handler table.
    pub fn find_handler(&self, thrown: &ExceptionClass, index: usize) -> Option<(usize, &ExceptionHandler)> {
        let mut best: Option<(usize, &ExceptionHandler)> = None;
        for (position, handler) in self.handlers.iter().enumerate() {
            if handler.matches(thrown, index) && handler.is_better_than(best.map(|(_, h)| h)) {
                best = Some((position, handler));
            }
        }
        best
    }

    pub(crate) fn trace_entry(&self, ip: usize) -> TraceEntry {
        let info = DebugInfo::lookup(&self.debug_infos, ip);
        TraceEntry {
            function: Arc::clone(&self.name),
            instruction: Some(ip),
            lines: info.map(|i| (i.start_line, i.end_line)),
            file: info.and_then(|i| i.file.clone()),
        }
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (locals={}, stack={}, continuations={})",
            self.name, self.num_locals, self.max_stack_size, self.max_continuation_depth
        )?;
        for (i, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "  {:4}: {:?}", i, instruction)?;
        }
        for handler in self.handlers.iter() {
            writeln!(
                f,
                "  handler [{}, {}) -> label {} {}",
                handler.start,
                handler.end,
                handler.label_index,
                handler.class.as_ref().map(|c| c.name()).unwrap_or("fault")
            )?;
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(Code: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::builtin;

    fn handler(start: usize, end: usize, handler_start: usize) -> ExceptionHandler {
        ExceptionHandler {
            start,
            end,
            label_index: handler_start,
            handler_start,
            handler_end: handler_start + 2,
            class: Some(Arc::clone(&builtin::EXCEPTION)),
        }
    }

    fn code_with(handlers: Vec<ExceptionHandler>) -> Code {
        Code {
            name: Arc::from("handlers"),
            instructions: Box::new([]),
            labels: Box::new([RuntimeLabel { index: RETHROW_ON_RETURN, stack_depth: 0, continuation_depth: 0 }]),
            handlers: handlers.into_boxed_slice(),
            debug_infos: Box::new([]),
            label_mapping: HashMap::new(),
            closure_variables: Vec::new(),
            arity: 0,
            num_locals: 0,
            max_stack_size: 0,
            max_continuation_depth: 0,
            compilation_threshold: 0,
            force_compile: false,
            returns_value: false,
        }
    }

    fn selected_start(code: &Code, index: usize) -> Option<usize> {
        code.find_handler(&builtin::DIVIDE_BY_ZERO, index).map(|(_, h)| h.start)
    }

    #[test]
    fn test_narrowest_region_wins() {
        let outer = handler(0, 10, 12);
        let inner = handler(2, 6, 10);
        // Order of the table must not matter.
        for table in [vec![outer.clone(), inner.clone()], vec![inner, outer]] {
            let code = code_with(table);
            assert_eq!(selected_start(&code, 4), Some(2));
            assert_eq!(selected_start(&code, 8), Some(0));
            assert_eq!(selected_start(&code, 10), None);
        }
    }

    #[test]
    fn test_identical_regions_prefer_first_handler() {
        let first = handler(0, 4, 6);
        let second = handler(0, 4, 9);
        assert!(first.is_better_than(Some(&second)));
        assert!(!second.is_better_than(Some(&first)));

        for table in [vec![first.clone(), second.clone()], vec![second, first]] {
            let code = code_with(table);
            let (_, chosen) = code.find_handler(&builtin::DIVIDE_BY_ZERO, 1).unwrap();
            assert_eq!(chosen.handler_start, 6);
        }
    }

    #[test]
    fn test_find_handler_skips_other_classes() {
        let mut narrow = handler(1, 3, 8);
        narrow.class = Some(Arc::clone(&builtin::NULL_REFERENCE));
        let code = code_with(vec![handler(0, 5, 6), narrow]);
        assert_eq!(code.find_handler(&builtin::DIVIDE_BY_ZERO, 2).map(|(position, _)| position), Some(0));
        assert_eq!(code.find_handler(&builtin::NULL_REFERENCE, 2).map(|(position, _)| position), Some(1));
    }

    #[test]
    fn test_class_filter() {
        let mut h = handler(0, 4, 6);
        h.class = Some(Arc::clone(&builtin::NULL_REFERENCE));
        assert!(!h.matches(&builtin::DIVIDE_BY_ZERO, 1));
        h.class = None;
        assert!(h.matches(&builtin::DIVIDE_BY_ZERO, 1));
    }

    #[test]
    fn test_debug_info_lookup() {
        let infos = [
            DebugInfo { index: 0, start_line: 1, end_line: 1, file: None, is_clear: false },
            DebugInfo { index: 5, start_line: 3, end_line: 4, file: None, is_clear: false },
            DebugInfo { index: 9, start_line: 0, end_line: 0, file: None, is_clear: true },
        ];
        assert_eq!(DebugInfo::lookup(&infos, 3).map(|i| i.start_line), Some(1));
        assert_eq!(DebugInfo::lookup(&infos, 5).map(|i| i.start_line), Some(3));
        assert!(DebugInfo::lookup(&infos, 10).is_none());
    }
}
