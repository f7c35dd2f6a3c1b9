//! Expression nodes to closures.

use super::analysis;
use super::{ClosureCompiler, Env, Exit, Thunk, thunk};
use crate::tiering::{LocalBinding, LoopBindings, NativeCompileError, NativeDelegate, NativeLambda};
use crate::tree::{BinaryOp, Expr, LambdaExpr, UnaryOp, Variable};
use crate::types::{Method, MethodKind, Type};
use crate::values::{Object, Value, ValueRef};
use crate::vm::{
    ArithOp, BitOp, ComparisonOp, Conversion, ExecutionContext, Fault, bit_op, convert, float_arith, int_arith, mismatch,
};
use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use std::sync::Arc;

/// Where a variable lives in an [`Env`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum VarLoc {
    Slot(usize),
    /// The slot holds a cell.
    Boxed(usize),
    Closure(usize),
}

pub(super) struct Builder<'b> {
    locations: HashMap<Variable, VarLoc>,
    next_slot: usize,
    captured: HashSet<Variable>,
    closure: HashMap<Variable, usize>,
    /// Set when compiling a loop lifted out of an interpreted frame.
    pub(super) bindings: Option<&'b LoopBindings>,
    /// Labels a jump may target from the node being compiled.
    pub(super) targets: Vec<u64>,
    /// Exception variables of the enclosing catch blocks, innermost last.
    pub(super) rethrow: Vec<VarLoc>,
}

impl<'b> Builder<'b> {
    pub(super) fn for_lambda(lambda: &LambdaExpr, closure_variables: &[Variable]) -> Self {
        Self {
            locations: HashMap::new(),
            next_slot: 0,
            captured: analysis::captured_variables(&lambda.body),
            closure: closure_variables.iter().enumerate().map(|(i, v)| (v.clone(), i)).collect(),
            bindings: None,
            targets: Vec::new(),
            rethrow: Vec::new(),
        }
    }

    /// Loop-local slots start after every frame slot the loop is bound to.
    pub(super) fn for_loop(body: &Expr, bindings: &'b LoopBindings) -> Self {
        let base = bindings
            .variables
            .values()
            .filter_map(|binding| match binding {
                LocalBinding::Slot { index, .. } => Some(*index as usize + 1),
                LocalBinding::Closure(_) => None,
            })
            .max()
            .unwrap_or(0);
        Self {
            locations: HashMap::new(),
            next_slot: base,
            captured: analysis::captured_variables(body),
            closure: HashMap::new(),
            bindings: Some(bindings),
            targets: Vec::new(),
            rethrow: Vec::new(),
        }
    }

    pub(super) fn slot_count(&self) -> usize {
        self.next_slot
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// Gives `variable` a fresh slot. Returns the new location and the one
    /// it shadows.
    pub(super) fn define(&mut self, variable: &Variable) -> (VarLoc, Option<VarLoc>) {
        let slot = self.next_slot;
        self.next_slot += 1;
        let location = if self.captured.contains(variable) || variable.is_by_ref() {
            VarLoc::Boxed(slot)
        } else {
            VarLoc::Slot(slot)
        };
        (location, self.locations.insert(variable.clone(), location))
    }

    pub(super) fn undefine(&mut self, variable: &Variable, shadowed: Option<VarLoc>) {
        match shadowed {
            Some(location) => self.locations.insert(variable.clone(), location),
            None => self.locations.remove(variable),
        };
    }

    pub(super) fn resolve(&self, variable: &Variable) -> Result<VarLoc, NativeCompileError> {
        if let Some(location) = self.locations.get(variable) {
            return Ok(*location);
        }
        if let Some(binding) = self.bindings.and_then(|b| b.variables.get(variable)) {
            return Ok(match *binding {
                LocalBinding::Slot { index, boxed: true } => VarLoc::Boxed(index as usize),
                LocalBinding::Slot { index, boxed: false } => VarLoc::Slot(index as usize),
                LocalBinding::Closure(index) => VarLoc::Closure(index as usize),
            });
        }
        if let Some(index) = self.closure.get(variable) {
            return Ok(VarLoc::Closure(*index));
        }
        Err(NativeCompileError::UnboundVariable { name: variable.name().to_string() })
    }

    // ========================================================================
    // Driver
    // ========================================================================

    pub(super) fn compile(&mut self, expr: &Expr) -> Result<Thunk, NativeCompileError> {
        Ok(match expr {
            Expr::Constant { value, .. } => {
                let value = value.clone();
                thunk(move |_, _| Ok(value.clone()))
            }
            Expr::Default(ty) => {
                let value = ty.default_value();
                thunk(move |_, _| Ok(value.clone()))
            }
            Expr::Parameter(variable) => {
                let location = self.resolve(variable)?;
                thunk(move |env, _| Ok(load(env, location)?))
            }
            Expr::Binary { op: BinaryOp::AndAlso, left, right } => self.compile_logical(left, right, true)?,
            Expr::Binary { op: BinaryOp::OrElse, left, right } => self.compile_logical(left, right, false)?,
            Expr::Binary { op, left, right } => {
                let op = *op;
                let left = self.compile(left)?;
                let right = self.compile(right)?;
                thunk(move |env, ctx| {
                    let a = left(env, ctx)?;
                    let b = right(env, ctx)?;
                    Ok(binary(op, a, b)?)
                })
            }
            Expr::Unary { op, operand } => {
                let op = *op;
                let operand = self.compile(operand)?;
                thunk(move |env, ctx| Ok(unary(op, operand(env, ctx)?)?))
            }
            Expr::Assign { target, value } => self.compile_assign(target, value)?,
            Expr::Block(block) => self.compile_block(block)?,
            Expr::Conditional { test, if_true, if_false, ty } => {
                let void = ty.is_void();
                let test = self.compile(test)?;
                let if_true = self.compile(if_true)?;
                let if_false = self.compile(if_false)?;
                thunk(move |env, ctx| {
                    let value = if truthy(test(env, ctx)?)? { if_true(env, ctx)? } else { if_false(env, ctx)? };
                    Ok(if void { Value::Null } else { value })
                })
            }
            Expr::Loop(looped) => self.compile_loop(looped, true)?,
            Expr::Goto { target, value, .. } => self.compile_goto(target, value.as_deref())?,
            Expr::Label { target, default } => self.compile_label(target, default.as_deref())?,
            Expr::Switch(switch) => self.compile_switch(switch)?,
            Expr::Try(try_expr) => self.compile_try(try_expr)?,
            Expr::Throw { value, .. } => self.compile_throw(value.as_deref())?,
            Expr::Lambda(lambda) => self.compile_lambda(lambda)?,
            Expr::Invoke { callee, args } => {
                let void = expr.ty().is_void();
                let callee = self.compile(callee)?;
                let args = self.compile_all(args)?;
                thunk(move |env, ctx| {
                    let function = match callee(env, ctx)? {
                        Value::Function(function) => function,
                        other => return Err(mismatch(&other, "function").into()),
                    };
                    let args = evaluate(&args, env, ctx)?;
                    let result = function.call(ctx, &args)?;
                    Ok(if void { Value::Null } else { result })
                })
            }
            Expr::Call { method, instance, args } => self.compile_call(method, instance.as_deref(), args)?,
            Expr::New { class, args } => {
                if args.len() != class.fields().len() {
                    return Err(NativeCompileError::Unsupported(format!("new {} with wrong arity", class.name())));
                }
                let class = Arc::clone(class);
                let args = self.compile_all(args)?;
                thunk(move |env, ctx| {
                    let fields = evaluate(&args, env, ctx)?.into_vec();
                    Ok(Value::Object(Object::new(&class, fields)))
                })
            }
            Expr::Field { target, index, .. } => {
                let index = *index;
                let target = self.compile(target)?;
                thunk(move |env, ctx| {
                    let value = target(env, ctx)?;
                    let object = value.as_object().ok_or_else(|| mismatch(&value, "object"))?;
                    let field = object.field(index).ok_or_else(|| no_field(object.class().name(), index))?;
                    Ok(field)
                })
            }
            Expr::NewArray { items, .. } => {
                let items = self.compile_all(items)?;
                thunk(move |env, ctx| Ok(Value::array(evaluate(&items, env, ctx)?.into_vec())))
            }
            Expr::NewArrayBounds { element, length } => {
                let default = element.default_value();
                let length = self.compile(length)?;
                thunk(move |env, ctx| {
                    let length = int(length(env, ctx)?)?;
                    let length = usize::try_from(length)
                        .map_err(|_| Fault::argument(format!("negative array length {}", length)))?;
                    Ok(Value::array(vec![default.clone(); length]))
                })
            }
            Expr::Index { array, index } => {
                let array = self.compile(array)?;
                let index = self.compile(index)?;
                thunk(move |env, ctx| {
                    let target = array(env, ctx)?;
                    let index = int(index(env, ctx)?)?;
                    let items = target.as_array().ok_or_else(|| mismatch(&target, "array"))?.read();
                    let item = usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .ok_or_else(|| Fault::index_out_of_range(index, items.len()))?;
                    Ok(item)
                })
            }
            Expr::ArrayLength(array) => {
                let array = self.compile(array)?;
                thunk(move |env, ctx| {
                    let target = array(env, ctx)?;
                    let len = target.as_array().ok_or_else(|| mismatch(&target, "array"))?.read().len();
                    Ok(Value::Int(len as i64))
                })
            }
            Expr::TypeIs { operand, ty } => {
                let ty = ty.clone();
                let operand = self.compile(operand)?;
                thunk(move |env, ctx| {
                    let value = operand(env, ctx)?;
                    Ok(Value::Bool(!value.is_null() && ty.accepts(&value)))
                })
            }
            Expr::TypeAs { operand, ty } => {
                let ty = ty.clone();
                let operand = self.compile(operand)?;
                thunk(move |env, ctx| {
                    let value = operand(env, ctx)?;
                    Ok(if ty.accepts(&value) { value } else { Value::Null })
                })
            }
            Expr::Convert { operand, ty } => self.compile_convert(operand, ty)?,
            Expr::Dynamic { site, args, ty } => {
                let void = ty.is_void();
                let site = Arc::clone(site);
                let args = self.compile_all(args)?;
                thunk(move |env, ctx| {
                    let args = evaluate(&args, env, ctx)?;
                    let result = site.invoke(ctx, &args)?;
                    Ok(if void { Value::Null } else { result })
                })
            }
            Expr::DebugInfo(_) => thunk(|_, _| Ok(Value::Null)),
            Expr::Extension(_) => match expr.reduce() {
                Some(reduced) => self.compile(&reduced)?,
                None => return Err(NativeCompileError::Unsupported("extension node that does not reduce".into())),
            },
        })
    }

    pub(super) fn compile_all(&mut self, exprs: &[Expr]) -> Result<Vec<Thunk>, NativeCompileError> {
        exprs.iter().map(|e| self.compile(e)).collect()
    }

    fn compile_logical(&mut self, left: &Expr, right: &Expr, and_also: bool) -> Result<Thunk, NativeCompileError> {
        let left = self.compile(left)?;
        let right = self.compile(right)?;
        Ok(thunk(move |env, ctx| {
            let first = truthy(left(env, ctx)?)?;
            if first != and_also {
                return Ok(Value::Bool(first));
            }
            Ok(Value::Bool(truthy(right(env, ctx)?)?))
        }))
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr) -> Result<Thunk, NativeCompileError> {
        match target {
            Expr::Parameter(variable) => {
                let location = self.resolve(variable)?;
                let value = self.compile(value)?;
                Ok(thunk(move |env, ctx| {
                    let value = value(env, ctx)?;
                    store(env, location, value.clone())?;
                    Ok(value)
                }))
            }
            Expr::Field { target, index, .. } => {
                let index = *index;
                let target = self.compile(target)?;
                let value = self.compile(value)?;
                Ok(thunk(move |env, ctx| {
                    let object = target(env, ctx)?;
                    let value = value(env, ctx)?;
                    let object = object.as_object().ok_or_else(|| mismatch(&object, "object"))?;
                    if !object.set_field(index, value.clone()) {
                        return Err(no_field(object.class().name(), index).into());
                    }
                    Ok(value)
                }))
            }
            Expr::Index { array, index } => {
                let array = self.compile(array)?;
                let index = self.compile(index)?;
                let value = self.compile(value)?;
                Ok(thunk(move |env, ctx| {
                    let target = array(env, ctx)?;
                    let index = int(index(env, ctx)?)?;
                    let value = value(env, ctx)?;
                    let mut items = target.as_array().ok_or_else(|| mismatch(&target, "array"))?.write();
                    let len = items.len();
                    let slot = usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get_mut(i))
                        .ok_or_else(|| Fault::index_out_of_range(index, len))?;
                    *slot = value.clone();
                    Ok(value)
                }))
            }
            other => Err(NativeCompileError::Unsupported(format!("assignment to {:?}", other.kind()))),
        }
    }

    fn compile_convert(&mut self, operand: &Expr, ty: &Type) -> Result<Thunk, NativeCompileError> {
        let from = operand.ty();
        let operand = self.compile(operand)?;
        let conversion = match (&from, ty) {
            (_, Type::Void) => {
                return Ok(thunk(move |env, ctx| {
                    operand(env, ctx)?;
                    Ok(Value::Null)
                }));
            }
            (from, to) if from == to => return Ok(operand),
            (_, Type::Any) => return Ok(operand),
            (Type::Int, Type::Float) => Conversion::IntToFloat,
            (Type::Float, Type::Int) => Conversion::FloatToInt,
            (Type::Bool, Type::Int) => Conversion::BoolToInt,
            (_, Type::Str) => Conversion::ToStr,
            _ => {
                let ty = ty.clone();
                return Ok(thunk(move |env, ctx| {
                    let value = operand(env, ctx)?;
                    if !ty.accepts(&value) {
                        return Err(Fault::invalid_cast(value.type_name(), &ty.to_string()).into());
                    }
                    Ok(value)
                }));
            }
        };
        Ok(thunk(move |env, ctx| Ok(convert(conversion, operand(env, ctx)?)?)))
    }

    fn compile_call(&mut self, method: &Arc<Method>, instance: Option<&Expr>, args: &[Expr]) -> Result<Thunk, NativeCompileError> {
        if args.len() != method.params().len() || method.has_receiver() != instance.is_some() {
            return Err(NativeCompileError::Unsupported(format!("call of {} with a wrong shape", method.name())));
        }
        let receiver = instance.map(|i| self.compile(i)).transpose()?;
        let compiled_args = self.compile_all(args)?;

        // Variables passed to by-ref parameters get the final values back.
        let mut write_back = Vec::new();
        for (position, (param, arg)) in method.params().iter().zip(args).enumerate() {
            if let (true, Expr::Parameter(variable)) = (param.by_ref, arg) {
                write_back.push((position, self.resolve(variable)?));
            }
        }

        let method = Arc::clone(method);
        let virtual_dispatch = method.kind() == MethodKind::Virtual;
        Ok(thunk(move |env, ctx| {
            let receiver = receiver.as_ref().map(|r| r(env, ctx)).transpose()?;
            let mut args = evaluate(&compiled_args, env, ctx)?;
            let target = match &receiver {
                Some(Value::Null) => {
                    return Err(Fault::null_reference(&format!("{} called on null", method.name())).into());
                }
                Some(Value::Object(object)) if virtual_dispatch => {
                    object.class().find_method(method.name()).cloned().unwrap_or_else(|| Arc::clone(&method))
                }
                _ => Arc::clone(&method),
            };
            let result = target.invoke(ctx, receiver.as_ref(), &mut args)?;
            for (position, location) in &write_back {
                store(env, *location, args[*position].clone())?;
            }
            Ok(if method.ret().is_void() { Value::Null } else { result })
        }))
    }

    fn compile_lambda(&mut self, lambda: &Arc<LambdaExpr>) -> Result<Thunk, NativeCompileError> {
        let free = analysis::free_variables(lambda);
        let mut captures = Vec::with_capacity(free.len());
        for variable in &free {
            match self.resolve(variable)? {
                VarLoc::Slot(_) => {
                    return Err(NativeCompileError::Unsupported(format!(
                        "capture of unboxed variable '{}'",
                        variable.name()
                    )));
                }
                location => captures.push(location),
            }
        }
        let compiled: Arc<dyn NativeLambda> = ClosureCompiler::new().lambda(lambda, &free)?;
        let name = Arc::clone(&lambda.name);
        Ok(thunk(move |env, _| {
            let cells = captures.iter().map(|location| cell_of(env, *location)).collect::<Result<Vec<_>, Fault>>()?;
            let closure = if cells.is_empty() { None } else { Some(Arc::from(cells)) };
            Ok(Value::Function(Arc::new(NativeDelegate::new(&name, Arc::clone(&compiled), closure))))
        }))
    }
}

// ============================================================================
// Runtime helpers
// ============================================================================

pub(super) fn load(env: &Env<'_>, location: VarLoc) -> Result<Value, Fault> {
    match location {
        VarLoc::Slot(slot) => Ok(env.slots[slot].clone()),
        VarLoc::Boxed(_) | VarLoc::Closure(_) => Ok(cell_of(env, location)?.get()),
    }
}

pub(super) fn store(env: &mut Env<'_>, location: VarLoc, value: Value) -> Result<(), Fault> {
    match location {
        VarLoc::Slot(slot) => env.slots[slot] = value,
        VarLoc::Boxed(_) | VarLoc::Closure(_) => cell_of(env, location)?.set(value),
    }
    Ok(())
}

/// Resets a variable on scope entry.
pub(super) fn initialize(env: &mut Env<'_>, location: VarLoc, value: Value) {
    match location {
        VarLoc::Slot(slot) => env.slots[slot] = value,
        VarLoc::Boxed(slot) => env.slots[slot] = Value::Ref(ValueRef::new(value)),
        VarLoc::Closure(_) => {}
    }
}

fn cell_of(env: &Env<'_>, location: VarLoc) -> Result<ValueRef, Fault> {
    match location {
        VarLoc::Boxed(slot) => match &env.slots[slot] {
            Value::Ref(cell) => Ok(cell.clone()),
            other => Err(Fault::internal(format!("expected a boxed local, found {}", other.type_name()))),
        },
        VarLoc::Closure(index) => {
            env.closure.get(index).cloned().ok_or_else(|| Fault::internal(format!("closure slot {} missing", index)))
        }
        VarLoc::Slot(_) => Err(Fault::internal("variable is not boxed")),
    }
}

pub(super) fn evaluate(
    thunks: &[Thunk],
    env: &mut Env<'_>,
    ctx: &mut ExecutionContext,
) -> Result<SmallVec<[Value; 4]>, Exit> {
    thunks.iter().map(|thunk| thunk(env, ctx)).collect()
}

pub(super) fn truthy(value: Value) -> Result<bool, Fault> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(mismatch(&other, "bool")),
    }
}

fn int(value: Value) -> Result<i64, Fault> {
    match value {
        Value::Int(i) => Ok(i),
        other => Err(mismatch(&other, "int")),
    }
}

fn no_field(class: &str, index: usize) -> Fault {
    Fault::missing_member(format!("no field {} on {}", index, class))
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value, Fault> {
    let arith = match op {
        BinaryOp::Add => Some(ArithOp::Add),
        BinaryOp::Subtract => Some(ArithOp::Sub),
        BinaryOp::Multiply => Some(ArithOp::Mul),
        BinaryOp::Divide => Some(ArithOp::Div),
        BinaryOp::Modulo => Some(ArithOp::Rem),
        _ => None,
    };
    if let Some(arith) = arith {
        return match (a, b) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_arith(arith, a, b)?)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_arith(arith, a, b))),
            (Value::Str(a), Value::Str(b)) if arith == ArithOp::Add => Ok(Value::Str(format!("{}{}", a, b).into())),
            (a, _) => Err(mismatch(&a, "number")),
        };
    }

    let comparison = match op {
        BinaryOp::Equal => return Ok(Value::Bool(a == b)),
        BinaryOp::NotEqual => return Ok(Value::Bool(a != b)),
        BinaryOp::LessThan => ComparisonOp::Less,
        BinaryOp::LessThanOrEqual => ComparisonOp::LessEqual,
        BinaryOp::GreaterThan => ComparisonOp::Greater,
        BinaryOp::GreaterThanOrEqual => ComparisonOp::GreaterEqual,
        BinaryOp::And => return bit_op(BitOp::And, a, b),
        BinaryOp::Or => return bit_op(BitOp::Or, a, b),
        BinaryOp::ExclusiveOr => return bit_op(BitOp::Xor, a, b),
        _ => return Err(Fault::internal(format!("{:?} is not a strict binary operator", op))),
    };
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(comparison.eval(&a, &b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Bool(comparison.eval(&a, &b))),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(comparison.eval(&a, &b))),
        (a, _) => Err(mismatch(&a, "comparable value")),
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, Fault> {
    match (op, value) {
        (UnaryOp::Negate, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (UnaryOp::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not | UnaryOp::OnesComplement, Value::Int(i)) => Ok(Value::Int(!i)),
        (_, other) => Err(mismatch(&other, "operand")),
    }
}
