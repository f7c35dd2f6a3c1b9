//! The run loop: executes a frame's instructions and dispatches faults to
//! handlers.

use super::code::{Code, RETHROW_ON_RETURN};
use super::context::ExecutionContext;
use super::fault::Fault;
use super::frame::Frame;
use super::instruction_set::{
    ArithOp, BitOp, Conversion, Instruction, LocalInit, SwitchKey,
};
use crate::tiering::{LoopExit, LoopFrame, NativeLoop};
use crate::types::Method;
use crate::values::{Callable, Object, Value, ValueRef};
use smallvec::SmallVec;
use std::sync::Arc;

pub struct VM;

impl VM {
    /// Runs `frame` until it returns or a fault escapes every handler.
    pub fn run(code: &Arc<Code>, ctx: &mut ExecutionContext, frame: &mut Frame) -> Result<(), Fault> {
        loop {
            match Self::run_main_loop(code, ctx, frame) {
                Ok(()) if frame.ip == RETHROW_ON_RETURN => {
                    return Err(frame
                        .fault
                        .take()
                        .unwrap_or_else(|| Fault::internal("frame left through the rethrow label without a fault")));
                }
                Ok(()) => return Ok(()),
                Err(fault) => Self::handle_fault(code, ctx, frame, fault),
            }
        }
    }

    fn run_main_loop(code: &Arc<Code>, ctx: &mut ExecutionContext, frame: &mut Frame) -> Result<(), Fault> {
        let instructions = &code.instructions;
        while let Some(instruction) = instructions.get(frame.ip) {
            let offset = Self::step(code, ctx, frame, instruction)?;
            frame.ip = frame.ip.wrapping_add_signed(offset);
        }
        Ok(())
    }

    /// Routes a fault raised at `frame.ip` to the best handler, or towards
    /// the rethrow label through any pending `finally` blocks.
    fn handle_fault(code: &Arc<Code>, ctx: &mut ExecutionContext, frame: &mut Frame, fault: Fault) {
        let exception = Arc::clone(fault.exception());
        ctx.set_ip(frame.record, frame.ip);
        exception.set_stack_trace_if_absent(|| ctx.stack_trace());
        ctx.note_abort(&fault);

        // A fault escaping the catch body that handles an abort leaves that
        // handler.
        if let Some((index, _)) = &frame.abort_handler {
            if code.handlers[*index].is_inside_handler(frame.ip) {
                frame.abort_handler = None;
                if !fault.is_abort() {
                    ctx.clear_abort_in_flight();
                }
            }
        }

        let label = match code.find_handler(exception.class(), frame.ip) {
            Some((index, handler)) => {
                tracing::debug!(
                    lambda = %code.name,
                    ip = frame.ip,
                    exception = %fault,
                    handler = index,
                    "Fault handled"
                );
                if fault.is_abort() && !handler.is_fault() {
                    frame.abort_handler = Some((index, Arc::clone(&exception)));
                }
                handler.label_index
            }
            None => {
                tracing::trace!(lambda = %code.name, ip = frame.ip, exception = %fault, "Fault leaves frame");
                code.rethrow_label()
            }
        };
        let offset = frame.goto(code, label as u32, Some(Value::Exception(exception)));
        frame.ip = frame.ip.wrapping_add_signed(offset);
    }

    /// Leaving a catch body that handles an abort re-raises the abort.
    fn exit_abort_handler(
        code: &Code,
        ctx: &mut ExecutionContext,
        frame: &mut Frame,
        label: u32,
    ) -> Result<(), Fault> {
        let Some((index, _)) = &frame.abort_handler else {
            return Ok(());
        };
        let target = code.labels[label as usize].index;
        if code.handlers[*index].is_inside_handler(target) {
            return Ok(());
        }
        match frame.abort_handler.take() {
            Some((_, abort)) => ctx.reraise_abort(&abort),
            None => Ok(()),
        }
    }

    fn step(
        code: &Arc<Code>,
        ctx: &mut ExecutionContext,
        frame: &mut Frame,
        instruction: &Instruction,
    ) -> Result<isize, Fault> {
        use Instruction::*;
        match instruction {
            Nop => {}

            // === Stack ===
            Push(value) => frame.push(value.clone()),
            Pop => {
                frame.pop();
            }
            Dup => {
                let value = frame.peek().clone();
                frame.push(value);
            }

            // === Locals ===
            LoadLocal(index) => {
                let value = frame.data[*index as usize].clone();
                frame.push(value);
            }
            LoadLocalBoxed(index) => {
                let value = cell(&frame.data[*index as usize])?.get();
                frame.push(value);
            }
            LoadLocalFromClosure(index) => {
                let value = closure_cell(frame, *index)?.get();
                frame.push(value);
            }
            LoadLocalFromClosureBoxed(index) => {
                let cell = closure_cell(frame, *index)?.clone();
                frame.push(Value::Ref(cell));
            }
            AssignLocal(index) => {
                let value = frame.peek().clone();
                frame.data[*index as usize] = value;
            }
            StoreLocal(index) => {
                let value = frame.pop();
                frame.data[*index as usize] = value;
            }
            AssignLocalBoxed(index) => {
                let value = frame.peek().clone();
                cell(&frame.data[*index as usize])?.set(value);
            }
            StoreLocalBoxed(index) => {
                let value = frame.pop();
                cell(&frame.data[*index as usize])?.set(value);
            }
            AssignLocalToClosure(index) => {
                let value = frame.peek().clone();
                closure_cell(frame, *index)?.set(value);
            }
            StoreLocalToClosure(index) => {
                let value = frame.pop();
                closure_cell(frame, *index)?.set(value);
            }
            InitializeLocal { index, init } => {
                let slot = *index as usize;
                match init {
                    LocalInit::Value(value) => frame.data[slot] = value.clone(),
                    LocalInit::Boxed(value) => frame.data[slot] = Value::Ref(ValueRef::new(value.clone())),
                    LocalInit::Parameter => {}
                    LocalInit::ParameterBoxed => {
                        let argument = std::mem::take(&mut frame.data[slot]);
                        frame.data[slot] = Value::Ref(ValueRef::new(argument));
                    }
                }
            }

            // === Arithmetic ===
            IntBinOp(op) => {
                let b = pop_int(frame)?;
                let a = pop_int(frame)?;
                frame.push(Value::Int(int_arith(*op, a, b)?));
            }
            FloatBinOp(op) => {
                let b = pop_float(frame)?;
                let a = pop_float(frame)?;
                frame.push(Value::Float(float_arith(*op, a, b)));
            }
            IntCmpOp(op) => {
                let b = pop_int(frame)?;
                let a = pop_int(frame)?;
                frame.push(Value::Bool(op.eval(&a, &b)));
            }
            FloatCmpOp(op) => {
                let b = pop_float(frame)?;
                let a = pop_float(frame)?;
                frame.push(Value::Bool(op.eval(&a, &b)));
            }
            StringCmpOp(op) => {
                let b = pop_str(frame)?;
                let a = pop_str(frame)?;
                frame.push(Value::Bool(op.eval(&a, &b)));
            }
            StringConcat => {
                let b = frame.pop();
                let a = frame.pop();
                let text = format!("{}{}", a.as_str().unwrap_or(""), b.as_str().unwrap_or(""));
                frame.push(Value::Str(text.into()));
            }
            Equal => {
                let b = frame.pop();
                let a = frame.pop();
                frame.push(Value::Bool(a == b));
            }
            NotEqual => {
                let b = frame.pop();
                let a = frame.pop();
                frame.push(Value::Bool(a != b));
            }
            NegInt => {
                let a = pop_int(frame)?;
                frame.push(Value::Int(a.wrapping_neg()));
            }
            NegFloat => {
                let a = pop_float(frame)?;
                frame.push(Value::Float(-a));
            }
            Not => {
                let a = pop_bool(frame)?;
                frame.push(Value::Bool(!a));
            }
            BitNot => {
                let a = pop_int(frame)?;
                frame.push(Value::Int(!a));
            }
            BitOp(op) => {
                let b = frame.pop();
                let a = frame.pop();
                frame.push(bit_op(*op, a, b)?);
            }

            // === Control flow ===
            Branch { offset, .. } => {
                if *offset <= 0 {
                    ctx.poll_abort()?;
                }
                return Ok(*offset);
            }
            BranchTrue(offset) => {
                if pop_bool(frame)? {
                    if *offset <= 0 {
                        ctx.poll_abort()?;
                    }
                    return Ok(*offset);
                }
            }
            BranchFalse(offset) => {
                if !pop_bool(frame)? {
                    if *offset <= 0 {
                        ctx.poll_abort()?;
                    }
                    return Ok(*offset);
                }
            }
            Switch(table) => {
                let key = frame.pop();
                if let Some(offset) = SwitchKey::from_value(&key).and_then(|k| table.cases.get(&k)) {
                    return Ok(*offset);
                }
            }
            Goto { label, has_value, .. } => {
                if code.labels[*label as usize].index <= frame.ip {
                    ctx.poll_abort()?;
                }
                Self::exit_abort_handler(code, ctx, frame, *label)?;
                let value = if *has_value { Some(frame.pop()) } else { None };
                return Ok(frame.goto(code, *label, value));
            }

            // === Exception regions ===
            EnterTryFinally { label } => frame.push_continuation(*label),
            EnterFinally => {
                frame.push_pending_continuation();
                frame.remove_continuation();
            }
            LeaveFinally => {
                frame.pop_pending_continuation();
                return Ok(frame.yield_to_pending_continuation(code));
            }
            // The engine placed the exception on the stack when it jumped
            // to the handler label.
            EnterExceptionHandler { .. } => {}
            LeaveExceptionHandler { label, .. } => {
                Self::exit_abort_handler(code, ctx, frame, *label)?;
                let target = code.labels[*label as usize].index;
                return Ok(target as isize - frame.ip as isize);
            }
            LeaveFault { .. } | Throw | ThrowVoid | Rethrow | RethrowVoid => {
                let exception = frame.pop();
                return Err(Fault::from_value(exception));
            }

            // === Loop tiering ===
            EnterLoop(tier) => {
                ctx.poll_abort()?;
                if let Some(compiled) = tier.as_ref().and_then(|t| t.enter()) {
                    return Self::run_compiled_loop(code, ctx, frame, compiled.as_ref());
                }
            }

            // === Calls ===
            Call { method, virtual_dispatch, write_back } => {
                Self::call_method(ctx, frame, method, *virtual_dispatch, *write_back)?;
            }
            Invoke { arg_count, void } => {
                let args = frame.pop_n(*arg_count as usize);
                let callee = frame.pop();
                let function = as_function(callee)?;
                ctx.set_ip(frame.record, frame.ip);
                let result = function.call(ctx, &args)?;
                if !*void {
                    frame.push(result);
                }
            }
            Dynamic { site, arg_count, void } => {
                let args = frame.pop_n(*arg_count as usize);
                ctx.set_ip(frame.record, frame.ip);
                let result = site.invoke(ctx, &args)?;
                if !*void {
                    frame.push(result);
                }
            }
            CreateDelegate { creator, captures } => {
                let cells = frame
                    .pop_n(*captures as usize)
                    .into_iter()
                    .map(|value| match value {
                        Value::Ref(cell) => Ok(cell),
                        other => Err(Fault::internal(format!("closure capture is a {}", other.type_name()))),
                    })
                    .collect::<Result<Vec<ValueRef>, Fault>>()?;
                let closure = if cells.is_empty() { None } else { Some(Arc::from(cells)) };
                frame.push(Value::Function(creator.create_delegate(closure)));
            }

            // === Objects and arrays ===
            New { class, arg_count } => {
                let fields = frame.pop_n(*arg_count as usize);
                frame.push(Value::Object(Object::new(class, fields)));
            }
            LoadField(index) => {
                let target = frame.pop();
                let object = target.as_object().ok_or_else(|| expected_object(&target))?;
                let value = object
                    .field(*index as usize)
                    .ok_or_else(|| Fault::missing_member(format!("no field {} on {}", index, object.class().name())))?;
                frame.push(value);
            }
            StoreField(index) => {
                let value = frame.pop();
                let target = frame.pop();
                let object = target.as_object().ok_or_else(|| expected_object(&target))?;
                if !object.set_field(*index as usize, value) {
                    return Err(Fault::missing_member(format!("no field {} on {}", index, object.class().name())));
                }
            }
            NewArray(count) => {
                let items = frame.pop_n(*count as usize);
                frame.push(Value::array(items));
            }
            NewArrayBounds(default) => {
                let length = pop_int(frame)?;
                let length =
                    usize::try_from(length).map_err(|_| Fault::argument(format!("negative array length {}", length)))?;
                frame.push(Value::array(vec![default.clone(); length]));
            }
            LoadElement => {
                let index = pop_int(frame)?;
                let target = frame.pop();
                let array = target.as_array().ok_or_else(|| expected_array(&target))?;
                let items = array.read();
                let item = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| Fault::index_out_of_range(index, items.len()))?;
                drop(items);
                frame.push(item);
            }
            StoreElement => {
                let value = frame.pop();
                let index = pop_int(frame)?;
                let target = frame.pop();
                let array = target.as_array().ok_or_else(|| expected_array(&target))?;
                let mut items = array.write();
                let len = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| Fault::index_out_of_range(index, len))?;
                *slot = value;
            }
            ArrayLength => {
                let target = frame.pop();
                let array = target.as_array().ok_or_else(|| expected_array(&target))?;
                let len = array.read().len() as i64;
                frame.push(Value::Int(len));
            }

            // === Types ===
            TypeIs(ty) => {
                let value = frame.pop();
                frame.push(Value::Bool(!value.is_null() && ty.accepts(&value)));
            }
            TypeAs(ty) => {
                let value = frame.pop();
                frame.push(if ty.accepts(&value) { value } else { Value::Null });
            }
            Cast(ty) => {
                let value = frame.pop();
                if !ty.accepts(&value) {
                    return Err(Fault::invalid_cast(value.type_name(), &ty.to_string()));
                }
                frame.push(value);
            }
            Convert(conversion) => {
                let value = frame.pop();
                frame.push(convert(*conversion, value)?);
            }
        }
        Ok(1)
    }

    fn call_method(
        ctx: &mut ExecutionContext,
        frame: &mut Frame,
        method: &Arc<Method>,
        virtual_dispatch: bool,
        write_back: bool,
    ) -> Result<(), Fault> {
        let mut args: SmallVec<[Value; 4]> = frame.pop_n(method.params().len()).into_iter().collect();
        let receiver = if method.has_receiver() { Some(frame.pop()) } else { None };
        let target = match &receiver {
            Some(Value::Null) => {
                return Err(Fault::null_reference(&format!("{} called on null", method.name())));
            }
            Some(Value::Object(object)) if virtual_dispatch => {
                object.class().find_method(method.name()).cloned().unwrap_or_else(|| Arc::clone(method))
            }
            _ => Arc::clone(method),
        };
        ctx.set_ip(frame.record, frame.ip);
        let result = target.invoke(ctx, receiver.as_ref(), &mut args)?;
        if !method.ret().is_void() {
            frame.push(result);
        }
        if write_back {
            for (param, arg) in method.params().iter().zip(args) {
                if param.by_ref {
                    frame.push(arg);
                }
            }
        }
        Ok(())
    }

    /// Hands the frame's locals to a compiled loop and continues at the
    /// label it exits through.
    fn run_compiled_loop(
        code: &Arc<Code>,
        ctx: &mut ExecutionContext,
        frame: &mut Frame,
        compiled: &dyn NativeLoop,
    ) -> Result<isize, Fault> {
        let closure = frame.closure.clone();
        let cells: &[ValueRef] = closure.as_deref().unwrap_or(&[]);
        ctx.set_ip(frame.record, frame.ip);
        let exit = {
            let mut loop_frame = LoopFrame { locals: &mut frame.data[..code.num_locals], closure: cells };
            compiled.run(ctx, &mut loop_frame)?
        };
        match exit {
            LoopExit::Goto { label, value } => Ok(frame.goto(code, label as u32, value)),
        }
    }
}

// ============================================================================
// Operand helpers
// ============================================================================

fn cell(value: &Value) -> Result<&ValueRef, Fault> {
    value.as_ref_cell().ok_or_else(|| Fault::internal(format!("expected a boxed local, found {}", value.type_name())))
}

fn closure_cell(frame: &Frame, index: u32) -> Result<&ValueRef, Fault> {
    frame.closure_cell(index).ok_or_else(|| Fault::internal(format!("closure slot {} missing", index)))
}

pub(crate) fn mismatch(value: &Value, expected: &str) -> Fault {
    match value {
        Value::Null => Fault::null_reference(&format!("expected {}, found null", expected)),
        other => Fault::invalid_cast(other.type_name(), expected),
    }
}

fn expected_object(value: &Value) -> Fault {
    mismatch(value, "object")
}

fn expected_array(value: &Value) -> Fault {
    mismatch(value, "array")
}

fn pop_int(frame: &mut Frame) -> Result<i64, Fault> {
    match frame.pop() {
        Value::Int(i) => Ok(i),
        other => Err(mismatch(&other, "int")),
    }
}

fn pop_float(frame: &mut Frame) -> Result<f64, Fault> {
    match frame.pop() {
        Value::Float(f) => Ok(f),
        other => Err(mismatch(&other, "float")),
    }
}

fn pop_bool(frame: &mut Frame) -> Result<bool, Fault> {
    match frame.pop() {
        Value::Bool(b) => Ok(b),
        other => Err(mismatch(&other, "bool")),
    }
}

fn pop_str(frame: &mut Frame) -> Result<Arc<str>, Fault> {
    match frame.pop() {
        Value::Str(s) => Ok(s),
        other => Err(mismatch(&other, "string")),
    }
}

fn as_function(value: Value) -> Result<Callable, Fault> {
    match value {
        Value::Function(function) => Ok(function),
        other => Err(mismatch(&other, "function")),
    }
}

pub(crate) fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<i64, Fault> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div if b == 0 => return Err(Fault::divide_by_zero()),
        ArithOp::Div => a.wrapping_div(b),
        ArithOp::Rem if b == 0 => return Err(Fault::divide_by_zero()),
        ArithOp::Rem => a.wrapping_rem(b),
    })
}

pub(crate) fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
    }
}

pub(crate) fn bit_op(op: BitOp, a: Value, b: Value) -> Result<Value, Fault> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            BitOp::And => a & b,
            BitOp::Or => a | b,
            BitOp::Xor => a ^ b,
        })),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
            BitOp::And => a & b,
            BitOp::Or => a | b,
            BitOp::Xor => a ^ b,
        })),
        (a, _) => Err(mismatch(&a, "int or bool")),
    }
}

pub(crate) fn convert(conversion: Conversion, value: Value) -> Result<Value, Fault> {
    match (conversion, value) {
        (Conversion::IntToFloat, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Conversion::FloatToInt, Value::Float(f)) => {
            if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                Ok(Value::Int(f.trunc() as i64))
            } else {
                Err(Fault::new(&crate::types::builtin::ARITHMETIC, format!("{} does not fit in an int", f)))
            }
        }
        (Conversion::BoolToInt, Value::Bool(b)) => Ok(Value::Int(b as i64)),
        (Conversion::ToStr, value) => Ok(Value::Str(display(&value).into())),
        (conversion, value) => Err(mismatch(&value, match conversion {
            Conversion::IntToFloat => "int",
            Conversion::FloatToInt => "float",
            Conversion::BoolToInt => "bool",
            Conversion::ToStr => "value",
        })),
    }
}

pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileError;
    use crate::types::{MethodKind, Type, builtin};
    use crate::values::ExceptionObject;
    use crate::vm::{ExceptionHandler, InstructionList};
    use hashbrown::HashMap;

    fn build(
        list: InstructionList,
        num_locals: usize,
        handlers: Vec<ExceptionHandler>,
        returns_value: bool,
    ) -> Result<Arc<Code>, CompileError> {
        let array = list.finalize()?;
        Ok(Arc::new(Code {
            name: "test".into(),
            instructions: array.instructions,
            labels: array.labels,
            handlers: handlers.into_boxed_slice(),
            debug_infos: Box::new([]),
            label_mapping: HashMap::new(),
            closure_variables: Vec::new(),
            arity: 0,
            num_locals,
            max_stack_size: array.max_stack_depth,
            max_continuation_depth: array.max_continuation_depth,
            compilation_threshold: 0,
            force_compile: false,
            returns_value,
        }))
    }

    fn execute(code: &Arc<Code>, ctx: &mut ExecutionContext) -> (Result<Value, Fault>, Frame) {
        let record = match ctx.enter_interpreted(code) {
            Ok(record) => record,
            Err(fault) => return (Err(fault), Frame::new(code, None, 0)),
        };
        let mut frame = Frame::new(code, None, record);
        let result = VM::run(code, ctx, &mut frame);
        ctx.leave_frame();
        let result = result.map(|()| if code.returns_value { frame.pop() } else { Value::Null });
        (result, frame)
    }

    fn catch_block(start: usize, end: usize, label: u32, handler_start: usize, handler_end: usize) -> ExceptionHandler {
        ExceptionHandler {
            start,
            end,
            label_index: label as usize,
            handler_start,
            handler_end,
            class: Some(Arc::clone(&builtin::EXCEPTION)),
        }
    }

    #[test]
    fn test_arithmetic() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        list.emit(Instruction::Push(Value::Int(6)));
        list.emit(Instruction::Push(Value::Int(7)));
        list.emit(Instruction::IntBinOp(ArithOp::Mul));
        let code = build(list, 0, vec![], true)?;
        let (result, _) = execute(&code, &mut ExecutionContext::new());
        assert_eq!(result.ok(), Some(Value::Int(42)));
        Ok(())
    }

    #[test]
    fn test_divide_by_zero_records_fault_point() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit(Instruction::Push(Value::Int(0)));
        list.emit(Instruction::IntBinOp(ArithOp::Div));
        let code = build(list, 0, vec![], true)?;
        let (result, _) = execute(&code, &mut ExecutionContext::new());
        let Err(fault) = result else {
            panic!("expected a fault");
        };
        assert_eq!(fault.class().name(), "DivideByZeroException");
        let trace = fault.exception().stack_trace().unwrap_or_default();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].instruction, Some(2));
        assert_eq!(&*trace[0].function, "test");
        Ok(())
    }

    #[test]
    fn test_catch_handler_replaces_value() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let end = list.make_label();
        let goto_end = list.make_label();
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit(Instruction::Push(Value::Int(0)));
        list.emit(Instruction::IntBinOp(ArithOp::Div));
        list.mark_label(goto_end)?;
        list.emit_goto(end, true, true);
        list.emit(Instruction::EnterExceptionHandler { has_value: true });
        let handler = list.mark_runtime_label()?;
        list.emit(Instruction::Pop);
        list.emit(Instruction::Push(Value::Int(-1)));
        list.emit_leave_exception_handler(true, goto_end);
        let handler_end = list.count();
        list.mark_label(end)?;

        let code = build(list, 0, vec![catch_block(0, 3, handler, 5, handler_end)], true)?;
        let (result, _) = execute(&code, &mut ExecutionContext::new());
        assert_eq!(result.ok(), Some(Value::Int(-1)));
        Ok(())
    }

    #[test]
    fn test_goto_out_of_try_runs_finally() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        let finally = list.make_label();
        let end = list.make_label();
        list.emit_enter_try_finally(finally);
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit_goto(end, true, true);
        list.mark_label(finally)?;
        list.emit(Instruction::EnterFinally);
        list.emit(Instruction::Push(Value::Int(7)));
        list.emit(Instruction::StoreLocal(0));
        list.emit(Instruction::LeaveFinally);
        list.mark_label(end)?;

        let code = build(list, 1, vec![], true)?;
        let (result, frame) = execute(&code, &mut ExecutionContext::new());
        assert_eq!(result.ok(), Some(Value::Int(1)));
        assert_eq!(frame.locals()[0], Value::Int(7));
        Ok(())
    }

    #[test]
    fn test_unhandled_fault_runs_finally_and_keeps_identity() -> Result<(), CompileError> {
        let exception = ExceptionObject::new(&builtin::ARGUMENT, "bad");
        let mut list = InstructionList::new();
        let finally = list.make_label();
        let end = list.make_label();
        list.emit_enter_try_finally(finally);
        list.emit(Instruction::Push(Value::Exception(Arc::clone(&exception))));
        list.emit(Instruction::ThrowVoid);
        list.emit_goto(end, false, false);
        list.mark_label(finally)?;
        list.emit(Instruction::EnterFinally);
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit(Instruction::StoreLocal(0));
        list.emit(Instruction::LeaveFinally);
        list.mark_label(end)?;

        let code = build(list, 1, vec![], false)?;
        let (result, frame) = execute(&code, &mut ExecutionContext::new());
        assert!(matches!(&result, Err(Fault::Exception(e)) if Arc::ptr_eq(e, &exception)));
        assert_eq!(frame.locals()[0], Value::Int(1));
        Ok(())
    }

    /// `try { while (true) {} } catch { slot0 = 5; }` with an optional
    /// `reset` call in the handler.
    fn spinning_catch(reset: bool) -> Result<Arc<Code>, CompileError> {
        let mut list = InstructionList::new();
        let top = list.make_label();
        let end = list.make_label();
        let goto_end = list.make_label();
        list.mark_label(top)?;
        list.emit_branch(top, false, false)?;
        list.mark_label(goto_end)?;
        list.emit_goto(end, false, false);
        list.emit(Instruction::EnterExceptionHandler { has_value: false });
        let handler = list.mark_runtime_label()?;
        let handler_start = list.count();
        list.emit(Instruction::Pop);
        if reset {
            let method = Method::new("reset", MethodKind::Static, vec![], Type::Void, |ctx, _, _| {
                ctx.abort_handle().reset();
                Ok(Value::Null)
            });
            list.emit(Instruction::Call { method, virtual_dispatch: false, write_back: false });
        }
        list.emit(Instruction::Push(Value::Int(5)));
        list.emit(Instruction::StoreLocal(0));
        list.emit_leave_exception_handler(false, goto_end);
        let handler_end = list.count();
        list.mark_label(end)?;
        build(list, 1, vec![catch_block(0, 1, handler, handler_start, handler_end)], false)
    }

    #[test]
    fn test_abort_is_reraised_after_catch() -> Result<(), CompileError> {
        let code = spinning_catch(false)?;
        let mut ctx = ExecutionContext::new();
        ctx.abort_handle().request(Value::str("stop"));
        let (result, frame) = execute(&code, &mut ctx);
        assert!(matches!(&result, Err(fault) if fault.is_abort()));
        assert_eq!(frame.locals()[0], Value::Int(5), "the handler still ran");
        Ok(())
    }

    #[test]
    fn test_reset_inside_handler_cancels_abort() -> Result<(), CompileError> {
        let code = spinning_catch(true)?;
        let mut ctx = ExecutionContext::new();
        ctx.abort_handle().request(Value::Null);
        let (result, frame) = execute(&code, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(frame.locals()[0], Value::Int(5));
        Ok(())
    }

    #[test]
    fn test_array_bounds() -> Result<(), CompileError> {
        let mut list = InstructionList::new();
        list.emit(Instruction::Push(Value::Int(1)));
        list.emit(Instruction::Push(Value::Int(2)));
        list.emit(Instruction::NewArray(2));
        list.emit(Instruction::Push(Value::Int(2)));
        list.emit(Instruction::LoadElement);
        let code = build(list, 0, vec![], true)?;
        let (result, _) = execute(&code, &mut ExecutionContext::new());
        assert!(matches!(result, Err(f) if f.class().name() == "IndexOutOfRangeException"));
        Ok(())
    }

    #[test]
    fn test_conversions() {
        assert_eq!(convert(Conversion::FloatToInt, Value::Float(-2.7)).ok(), Some(Value::Int(-2)));
        assert!(convert(Conversion::FloatToInt, Value::Float(f64::NAN)).is_err());
        assert_eq!(convert(Conversion::ToStr, Value::Int(3)).ok(), Some(Value::str("3")));
        assert_eq!(int_arith(ArithOp::Add, i64::MAX, 1).ok(), Some(i64::MIN));
    }
}
