//! Blocks, jumps, loops, switches and exception regions.
//!
//! A jump is an [`Exit::Jump`] unwinding through the Rust stack until the
//! closure that owns its label catches it: a block for its direct labels,
//! a label node for jumps out of its default, a loop for its break and
//! continue labels. Jumps to anything else are rejected at compile time,
//! so a jump never escapes the lambda it was compiled in.

use super::lower::{Builder, VarLoc, initialize, load, truthy};
use super::{Env, Exit, Thunk, thunk};
use crate::tiering::NativeCompileError;
use crate::tree::{BlockExpr, Expr, LabelTarget, LoopExpr, SwitchExpr, TryExpr, Variable};
use crate::types::{ExceptionClass, Type};
use crate::values::Value;
use crate::vm::{ExecutionContext, Fault, SwitchKey};
use hashbrown::HashMap;
use std::sync::Arc;

struct Handler {
    class: Arc<ExceptionClass>,
    location: VarLoc,
    filter: Option<Thunk>,
    body: Thunk,
}

impl Builder<'_> {
    pub(super) fn compile_block(&mut self, block: &BlockExpr) -> Result<Thunk, NativeCompileError> {
        let mut defined = Vec::with_capacity(block.variables.len());
        let mut inits = Vec::with_capacity(block.variables.len());
        for variable in &block.variables {
            let (location, shadowed) = self.define(variable);
            inits.push((location, variable.ty().default_value()));
            defined.push((variable, shadowed));
        }

        // Label id to (position, value when jumped to without one).
        let positions: HashMap<u64, (usize, Value)> = block
            .expressions
            .iter()
            .enumerate()
            .filter_map(|(i, expr)| match expr {
                Expr::Label { target, .. } => Some((target.id(), (i, target.ty().default_value()))),
                _ => None,
            })
            .collect();

        let depth = self.targets.len();
        self.targets.extend(positions.keys().copied());
        let expressions = self.compile_all(&block.expressions);
        self.targets.truncate(depth);
        for (variable, shadowed) in defined.into_iter().rev() {
            self.undefine(variable, shadowed);
        }
        let expressions = expressions?;

        let void = block.ty.is_void();
        Ok(thunk(move |env, ctx| {
            for (location, value) in &inits {
                initialize(env, *location, value.clone());
            }
            let mut last = Value::Null;
            let mut i = 0;
            while let Some(expr) = expressions.get(i) {
                match expr(env, ctx) {
                    Ok(value) => {
                        last = value;
                        i += 1;
                    }
                    Err(Exit::Jump { label, value }) => match positions.get(&label) {
                        Some((position, fallback)) => {
                            if *position <= i {
                                ctx.poll_abort()?;
                            }
                            last = value.unwrap_or_else(|| fallback.clone());
                            i = position + 1;
                        }
                        None => return Err(Exit::Jump { label, value }),
                    },
                    Err(fault) => return Err(fault),
                }
            }
            Ok(if void { Value::Null } else { last })
        }))
    }

    pub(super) fn compile_label(
        &mut self,
        target: &LabelTarget,
        default: Option<&Expr>,
    ) -> Result<Thunk, NativeCompileError> {
        let id = target.id();
        let fallback = target.ty().default_value();
        let void = target.ty().is_void();

        self.targets.push(id);
        let default = default.map(|d| self.compile(d)).transpose();
        self.targets.pop();
        let default = default?;

        Ok(thunk(move |env, ctx| {
            let value = match &default {
                None => fallback.clone(),
                Some(default) => match default(env, ctx) {
                    Ok(value) => value,
                    Err(Exit::Jump { label, value }) if label == id => value.unwrap_or_else(|| fallback.clone()),
                    Err(e) => return Err(e),
                },
            };
            Ok(if void { Value::Null } else { value })
        }))
    }

    pub(super) fn compile_goto(&mut self, target: &LabelTarget, value: Option<&Expr>) -> Result<Thunk, NativeCompileError> {
        let id = target.id();
        let external = self.bindings.is_some_and(|b| b.labels.contains_key(target));
        if !external && !self.targets.contains(&id) {
            return Err(NativeCompileError::InvalidJump { label: target.name().to_string() });
        }
        let value = value.map(|v| self.compile(v)).transpose()?;
        Ok(thunk(move |env, ctx| {
            let value = value.as_ref().map(|v| v(env, ctx)).transpose()?;
            Err(Exit::Jump { label: id, value })
        }))
    }

    /// `owns_break` is false for a loop lifted out of an interpreted frame:
    /// its break label belongs to the frame.
    pub(super) fn compile_loop(&mut self, looped: &LoopExpr, owns_break: bool) -> Result<Thunk, NativeCompileError> {
        let break_id = looped.break_label.as_ref().map(LabelTarget::id).filter(|_| owns_break);
        let continue_id = looped.continue_label.as_ref().map(LabelTarget::id);

        let depth = self.targets.len();
        self.targets.extend(break_id);
        self.targets.extend(continue_id);
        let body = self.compile(&looped.body);
        self.targets.truncate(depth);
        let body = body?;

        Ok(thunk(move |env, ctx| {
            loop {
                ctx.poll_abort()?;
                match body(env, ctx) {
                    Ok(_) => {}
                    Err(Exit::Jump { label, value }) if Some(label) == break_id => {
                        return Ok(value.unwrap_or_default());
                    }
                    Err(Exit::Jump { label, .. }) if Some(label) == continue_id => {}
                    Err(e) => return Err(e),
                }
            }
        }))
    }

    pub(super) fn compile_switch(&mut self, switch: &SwitchExpr) -> Result<Thunk, NativeCompileError> {
        if !matches!(switch.value.ty(), Type::Int | Type::Bool | Type::Str) {
            return Err(NativeCompileError::Unsupported(format!("switch over {}", switch.value.ty())));
        }
        let void = switch.ty.is_void();
        let value = self.compile(&switch.value)?;

        let mut table = HashMap::new();
        let mut bodies = Vec::with_capacity(switch.cases.len());
        for (i, case) in switch.cases.iter().enumerate() {
            for test in &case.tests {
                let key = match test {
                    Expr::Constant { value, .. } => SwitchKey::from_value(value),
                    _ => None,
                }
                .ok_or_else(|| NativeCompileError::Unsupported("switch case test is not a constant".into()))?;
                table.entry(key).or_insert(i);
            }
            bodies.push(self.compile(&case.body)?);
        }
        let default = switch.default.as_ref().map(|d| self.compile(d)).transpose()?;

        Ok(thunk(move |env, ctx| {
            let key = SwitchKey::from_value(&value(env, ctx)?);
            let body = key.and_then(|key| table.get(&key)).and_then(|case| bodies.get(*case));
            let result = match (body, &default) {
                (Some(body), _) => body(env, ctx)?,
                (None, Some(default)) => default(env, ctx)?,
                (None, None) => Value::Null,
            };
            Ok(if void { Value::Null } else { result })
        }))
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    pub(super) fn compile_throw(&mut self, value: Option<&Expr>) -> Result<Thunk, NativeCompileError> {
        match value {
            Some(value) => {
                let value = self.compile(value)?;
                Ok(thunk(move |env, ctx| Err(Fault::from_value(value(env, ctx)?).into())))
            }
            None => {
                let location = *self
                    .rethrow
                    .last()
                    .ok_or_else(|| NativeCompileError::Unsupported("rethrow outside a catch block".into()))?;
                Ok(thunk(move |env, _| Err(Fault::from_value(load(env, location)?).into())))
            }
        }
    }

    pub(super) fn compile_try(&mut self, try_expr: &TryExpr) -> Result<Thunk, NativeCompileError> {
        let void = try_expr.ty.is_void();
        let body = self.compile(&try_expr.body)?;

        let mut handlers = Vec::with_capacity(try_expr.handlers.len());
        for handler in &try_expr.handlers {
            let class = match &handler.class {
                Type::Exception(class) => Arc::clone(class),
                other => return Err(NativeCompileError::Unsupported(format!("catch of {}", other))),
            };
            let variable = handler.variable.clone().unwrap_or_else(|| Variable::anonymous(handler.class.clone()));
            let (location, shadowed) = self.define(&variable);
            let filter = handler.filter.as_ref().map(|f| self.compile(f)).transpose();
            self.rethrow.push(location);
            let body = self.compile(&handler.body);
            self.rethrow.pop();
            self.undefine(&variable, shadowed);
            handlers.push(Handler { class, location, filter: filter?, body: body? });
        }

        let finally = try_expr.finally.as_ref().map(|f| self.compile(f)).transpose()?;
        let fault_block = try_expr.fault.as_ref().map(|f| self.compile(f)).transpose()?;

        Ok(thunk(move |env, ctx| {
            let outcome = match body(env, ctx) {
                Err(Exit::Fault(fault)) => {
                    fault.exception().set_stack_trace_if_absent(|| ctx.stack_trace());
                    ctx.note_abort(&fault);
                    match &fault_block {
                        Some(fault_block) => fault_block(env, ctx).and(Err(Exit::Fault(fault))),
                        None => catch(&handlers, fault, env, ctx),
                    }
                }
                other => other,
            };
            let outcome = match &finally {
                Some(finally) => finally(env, ctx).and(outcome),
                None => outcome,
            };
            let value = outcome?;
            Ok(if void { Value::Null } else { value })
        }))
    }
}

/// Runs the first handler matching `fault`, or hands the fault back.
fn catch(handlers: &[Handler], fault: Fault, env: &mut Env<'_>, ctx: &mut ExecutionContext) -> Result<Value, Exit> {
    let exception = Value::Exception(Arc::clone(fault.exception()));
    for handler in handlers {
        if !handler.class.is_assignable_from(fault.class()) {
            continue;
        }
        initialize(env, handler.location, exception.clone());
        if let Some(filter) = &handler.filter {
            // A filter that faults does not match.
            let accepted = filter(env, ctx).ok().map(truthy).and_then(Result::ok).unwrap_or(false);
            if !accepted {
                continue;
            }
        }

        let result = (handler.body)(env, ctx);
        if fault.is_abort() {
            match &result {
                Err(Exit::Fault(next)) if next.is_abort() => {}
                Err(Exit::Fault(_)) => ctx.clear_abort_in_flight(),
                _ => ctx.reraise_abort(fault.exception())?,
            }
        }
        return result;
    }
    Err(Exit::Fault(fault))
}
