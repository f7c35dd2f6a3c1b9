//! Activation record of an interpreted lambda.

use super::code::{Code, RETHROW_ON_RETURN};
use super::fault::Fault;
use crate::values::{ExceptionRef, Value, ValueRef};
use std::sync::Arc;

/// Marker for "no pending continuation" when saved on the operand stack.
const NO_CONTINUATION: i64 = -1;

pub struct Frame {
    /// Local slots followed by the operand stack.
    pub(crate) data: Vec<Value>,
    /// Next free operand slot.
    pub(crate) stack_index: usize,
    base: usize,
    pub(crate) closure: Option<Arc<[ValueRef]>>,
    continuations: Vec<u32>,
    pending_continuation: Option<u32>,
    pending_value: Option<Value>,
    /// Current instruction; the fault point while unwinding.
    pub(crate) ip: usize,
    /// Index of this activation in the execution context's logical stack.
    pub(crate) record: usize,
    /// Fault to raise when the rethrow label is reached.
    pub(crate) fault: Option<Fault>,
    /// Catch handler currently handling an abort, with the abort exception.
    pub(crate) abort_handler: Option<(usize, ExceptionRef)>,
}

impl Frame {
    pub(crate) fn new(code: &Code, closure: Option<Arc<[ValueRef]>>, record: usize) -> Self {
        let base = code.num_locals;
        Self {
            data: vec![Value::Null; base + code.max_stack_size],
            stack_index: base,
            base,
            closure,
            continuations: Vec::with_capacity(code.max_continuation_depth),
            pending_continuation: None,
            pending_value: None,
            ip: 0,
            record,
            fault: None,
            abort_handler: None,
        }
    }

    // ========================================================================
    // Operand stack
    // ========================================================================

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.data[self.stack_index] = value;
        self.stack_index += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack_index -= 1;
        std::mem::take(&mut self.data[self.stack_index])
    }

    #[inline]
    pub(crate) fn peek(&self) -> &Value {
        &self.data[self.stack_index - 1]
    }

    /// Pops `n` values, returning them in push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let start = self.stack_index - n;
        let values = self.data[start..self.stack_index].iter_mut().map(std::mem::take).collect();
        self.stack_index = start;
        values
    }

    #[cfg(test)]
    pub(crate) fn stack_depth(&self) -> usize {
        self.stack_index - self.base
    }

    pub(crate) fn set_stack_depth(&mut self, depth: usize) {
        let new_index = self.base + depth;
        for slot in &mut self.data[new_index.min(self.stack_index)..self.stack_index] {
            *slot = Value::Null;
        }
        self.stack_index = new_index;
    }

    #[cfg(test)]
    pub(crate) fn locals(&self) -> &[Value] {
        &self.data[..self.base]
    }

    pub(crate) fn closure_cell(&self, index: u32) -> Option<&ValueRef> {
        self.closure.as_deref().and_then(|cells| cells.get(index as usize))
    }

    // ========================================================================
    // Continuations
    // ========================================================================

    pub(crate) fn push_continuation(&mut self, label: u32) {
        self.continuations.push(label);
    }

    pub(crate) fn remove_continuation(&mut self) {
        self.continuations.pop();
    }

    /// Saves the pending continuation and value on the operand stack, so
    /// that a nested goto inside the `finally` body cannot lose them.
    pub(crate) fn push_pending_continuation(&mut self) {
        let encoded = match self.pending_continuation.take() {
            Some(label) => ((label as i64) << 1) | self.pending_value.is_some() as i64,
            None => NO_CONTINUATION,
        };
        let value = self.pending_value.take().unwrap_or_default();
        self.push(Value::Int(encoded));
        self.push(value);
    }

    pub(crate) fn pop_pending_continuation(&mut self) {
        let value = self.pop();
        let encoded = self.pop().as_int().unwrap_or(NO_CONTINUATION);
        if encoded < 0 {
            self.pending_continuation = None;
            self.pending_value = None;
        } else {
            self.pending_continuation = Some((encoded >> 1) as u32);
            self.pending_value = if encoded & 1 == 1 { Some(value) } else { None };
        }
    }

    /// Jumps to a runtime label. If `finally` blocks lie between here and
    /// the target, the jump becomes pending and the innermost `finally`
    /// runs first.
    pub(crate) fn goto(&mut self, code: &Code, label_index: u32, value: Option<Value>) -> isize {
        let target = code.labels[label_index as usize];
        if self.continuations.len() == target.continuation_depth {
            return self.arrive(code, label_index, value);
        }
        // A newer jump replaces any older pending one.
        self.pending_continuation = Some(label_index);
        self.pending_value = value;
        self.yield_to_current_continuation(code)
    }

    pub(crate) fn yield_to_current_continuation(&mut self, code: &Code) -> isize {
        let Some(&current) = self.continuations.last() else {
            return 1;
        };
        let target = code.labels[current as usize];
        self.set_stack_depth(target.stack_depth);
        target.index as isize - self.ip as isize
    }

    pub(crate) fn yield_to_pending_continuation(&mut self, code: &Code) -> isize {
        let Some(pending) = self.pending_continuation else {
            return 1;
        };
        let target = code.labels[pending as usize];
        // Inner finally blocks run before the pending target is reached.
        if target.continuation_depth < self.continuations.len() {
            return self.yield_to_current_continuation(code);
        }
        self.pending_continuation = None;
        let value = self.pending_value.take();
        self.arrive(code, pending, value)
    }

    fn arrive(&mut self, code: &Code, label_index: u32, value: Option<Value>) -> isize {
        let target = code.labels[label_index as usize];
        if target.index == RETHROW_ON_RETURN {
            if let Some(value) = value {
                self.fault = Some(Fault::from_value(value));
            }
            return target.index as isize - self.ip as isize;
        }
        self.set_stack_depth(target.stack_depth);
        if let Some(value) = value {
            self.data[self.stack_index - 1] = value;
        }
        target.index as isize - self.ip as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::RuntimeLabel;
    use hashbrown::HashMap;

    fn code_with_labels(labels: Vec<RuntimeLabel>) -> Code {
        Code {
            name: "test".into(),
            instructions: Box::new([]),
            labels: labels.into_boxed_slice(),
            handlers: Box::new([]),
            debug_infos: Box::new([]),
            label_mapping: HashMap::new(),
            closure_variables: Vec::new(),
            arity: 0,
            num_locals: 1,
            max_stack_size: 4,
            max_continuation_depth: 2,
            compilation_threshold: 0,
            force_compile: false,
            returns_value: false,
        }
    }

    #[test]
    fn test_goto_without_finally_jumps_directly() {
        let code = code_with_labels(vec![
            RuntimeLabel { index: 7, stack_depth: 1, continuation_depth: 0 },
            RuntimeLabel { index: RETHROW_ON_RETURN, stack_depth: 0, continuation_depth: 0 },
        ]);
        let mut frame = Frame::new(&code, None, 0);
        frame.ip = 3;
        frame.push(Value::Int(1));
        frame.push(Value::Int(2));
        let offset = frame.goto(&code, 0, Some(Value::Int(9)));
        assert_eq!(offset, 4);
        assert_eq!(frame.stack_depth(), 1);
        assert_eq!(frame.peek(), &Value::Int(9));
    }

    #[test]
    fn test_goto_through_finally_becomes_pending() {
        let code = code_with_labels(vec![
            // finally entry
            RuntimeLabel { index: 10, stack_depth: 0, continuation_depth: 0 },
            // target outside the try
            RuntimeLabel { index: 20, stack_depth: 1, continuation_depth: 0 },
            RuntimeLabel { index: RETHROW_ON_RETURN, stack_depth: 0, continuation_depth: 0 },
        ]);
        let mut frame = Frame::new(&code, None, 0);
        frame.ip = 5;
        frame.push_continuation(0);
        let offset = frame.goto(&code, 1, Some(Value::Int(42)));
        assert_eq!(offset, 5, "runs the finally block first");

        // EnterFinally
        frame.ip = 10;
        frame.push_pending_continuation();
        frame.remove_continuation();
        assert_eq!(frame.stack_depth(), 2);

        // LeaveFinally
        frame.ip = 15;
        frame.pop_pending_continuation();
        let offset = frame.yield_to_pending_continuation(&code);
        assert_eq!(offset, 5);
        assert_eq!(frame.peek(), &Value::Int(42));
    }

    #[test]
    fn test_reaching_rethrow_label_records_fault() {
        let code = code_with_labels(vec![RuntimeLabel {
            index: RETHROW_ON_RETURN,
            stack_depth: 0,
            continuation_depth: 0,
        }]);
        let mut frame = Frame::new(&code, None, 0);
        let exception = Fault::divide_by_zero().into_exception();
        frame.goto(&code, 0, Some(Value::Exception(Arc::clone(&exception))));
        assert!(matches!(&frame.fault, Some(Fault::Exception(e)) if Arc::ptr_eq(e, &exception)));
    }
}
