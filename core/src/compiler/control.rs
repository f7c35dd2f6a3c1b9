//! Branches, loops, labels, switches and exception regions.

use super::bytecode::{BytecodeCompiler, PendingLoop};
use super::labels::LabelScopeKind;
use super::CompileError;
use crate::tree::{BlockExpr, CatchBlock, Expr, LabelTarget, LoopExpr, SwitchExpr, TryExpr, Variable};
use crate::types::Type;
use crate::values::Value;
use crate::vm::{ExceptionHandler, Instruction, LocalInit, SwitchKey, SwitchTable};
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;

impl BytecodeCompiler<'_> {
    pub(super) fn compile_logical(&mut self, left: &Expr, right: &Expr, and_also: bool) -> Result<(), CompileError> {
        let else_label = self.instructions.make_label();
        let end_label = self.instructions.make_label();
        self.compile(left)?;
        if and_also {
            self.instructions.emit_branch_false(else_label)?;
        } else {
            self.instructions.emit_branch_true(else_label)?;
        }
        self.compile(right)?;
        self.instructions.emit_branch(end_label, false, true)?;
        self.instructions.mark_label(else_label)?;
        self.instructions.emit(Instruction::Push(Value::Bool(!and_also)));
        self.instructions.mark_label(end_label)
    }

    pub(super) fn compile_conditional(
        &mut self,
        test: &Expr,
        if_true: &Expr,
        if_false: &Expr,
        as_void: bool,
    ) -> Result<(), CompileError> {
        self.compile(test)?;
        if is_empty(if_true) {
            let end_of_false = self.instructions.make_label();
            self.instructions.emit_branch_true(end_of_false)?;
            self.compile_maybe_void(if_false, as_void)?;
            return self.instructions.mark_label(end_of_false);
        }

        let end_of_true = self.instructions.make_label();
        self.instructions.emit_branch_false(end_of_true)?;
        self.compile_maybe_void(if_true, as_void)?;
        if is_empty(if_false) {
            return self.instructions.mark_label(end_of_true);
        }
        let end_of_false = self.instructions.make_label();
        self.instructions.emit_branch(end_of_false, false, !as_void)?;
        self.instructions.mark_label(end_of_true)?;
        self.compile_maybe_void(if_false, as_void)?;
        self.instructions.mark_label(end_of_false)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    pub(super) fn compile_loop(&mut self, looped: &Arc<LoopExpr>) -> Result<(), CompileError> {
        // Variables visible at the header, resolved once boxing is final.
        let scopes = self.locals.visible_scopes();

        self.labels.push(LabelScopeKind::Statement);
        let break_id = self.labels.define(looped.break_label.as_ref())?;
        let continue_id = self.labels.define(looped.continue_label.as_ref())?;
        let break_label = self.labels.branch_label(break_id, &mut self.instructions);
        let continue_label = self.labels.branch_label(continue_id, &mut self.instructions);

        self.instructions.mark_label(continue_label)?;
        let header = self.instructions.emit(Instruction::EnterLoop(None));
        self.compile_as_void(&looped.body)?;
        self.instructions.emit_branch(continue_label, !looped.ty().is_void(), false)?;
        self.instructions.mark_label(break_label)?;
        self.labels.pop(LabelScopeKind::Statement);

        // Labels the compiled loop may leave through, as runtime labels.
        let mut gotos = Vec::new();
        let mut defined = HashSet::new();
        collect_labels(&looped.body, &mut gotos, &mut defined);
        defined.extend(looped.continue_label.iter().cloned());
        gotos.extend(looped.break_label.iter().cloned());
        let mut labels = HashMap::new();
        for target in gotos {
            if defined.contains(&target) || labels.contains_key(&target) {
                continue;
            }
            if let Some(label) = self.labels.branch_label_of(&target) {
                labels.insert(target, self.instructions.ensure_label_index(label) as usize);
            }
        }

        self.pending_loops.push(PendingLoop { instruction: header, expr: Arc::clone(looped), scopes, labels });
        Ok(())
    }

    // ========================================================================
    // Labels and gotos
    // ========================================================================

    pub(super) fn compile_goto(&mut self, target: &LabelTarget, value: Option<&Expr>, ty: &Type) -> Result<(), CompileError> {
        let id = self.labels.reference(target)?;
        let label = self.labels.branch_label(id, &mut self.instructions);
        let has_value = match value {
            Some(value) => {
                self.compile(value)?;
                !value.ty().is_void()
            }
            None => false,
        };
        if has_value != !target.ty().is_void() {
            return Err(CompileError::InvalidJump(format!(
                "jump to '{}' carries {} value",
                target.name(),
                if has_value { "an unexpected" } else { "no" }
            )));
        }
        self.instructions.emit_goto(label, !ty.is_void(), has_value);
        Ok(())
    }

    pub(super) fn compile_label(&mut self, target: &LabelTarget, default: Option<&Expr>) -> Result<(), CompileError> {
        let id = match self.labels.find_in_block(target) {
            Some(id) => id,
            None => self.labels.define(Some(target))?,
        };
        match default {
            Some(value) => self.compile(value)?,
            None if !target.ty().is_void() => {
                self.instructions.emit(Instruction::Push(target.ty().default_value()));
            }
            None => {}
        }
        let label = self.labels.branch_label(id, &mut self.instructions);
        self.instructions.mark_label(label)
    }

    // ========================================================================
    // Switch
    // ========================================================================

    pub(super) fn compile_switch(&mut self, switch: &SwitchExpr) -> Result<(), CompileError> {
        let has_value = !switch.ty.is_void();
        if !matches!(switch.value.ty(), Type::Int | Type::Bool | Type::Str) {
            return Err(CompileError::unsupported(format!("switch over {}", switch.value.ty())));
        }
        if has_value && switch.default.is_none() {
            return Err(CompileError::unsupported("switch with a value but no default"));
        }

        let mut keys = Vec::with_capacity(switch.cases.len());
        for case in &switch.cases {
            let mut case_keys = Vec::with_capacity(case.tests.len());
            for test in &case.tests {
                let key = match test {
                    Expr::Constant { value, .. } => SwitchKey::from_value(value),
                    _ => None,
                };
                case_keys.push(key.ok_or_else(|| CompileError::unsupported("switch case test is not a constant"))?);
            }
            keys.push(case_keys);
        }

        let end = self.instructions.make_label();
        self.compile(&switch.value)?;
        let switch_index = self.instructions.emit(Instruction::Switch(Arc::new(SwitchTable::default())));

        if let Some(default) = &switch.default {
            self.compile_maybe_void(default, !has_value)?;
        }
        if !switch.cases.is_empty() {
            self.instructions.emit_branch(end, false, has_value)?;
        }

        let mut table = SwitchTable::default();
        for (i, (case, case_keys)) in switch.cases.iter().zip(keys).enumerate() {
            let offset = (self.instructions.count() - switch_index) as isize;
            for key in case_keys {
                // The first case with a value wins.
                table.cases.entry(key).or_insert(offset);
            }
            self.compile_maybe_void(&case.body, !has_value)?;
            if i + 1 < switch.cases.len() {
                self.instructions.emit_branch(end, false, has_value)?;
            }
        }
        self.instructions.replace(switch_index, Instruction::Switch(Arc::new(table)));
        self.instructions.mark_label(end)
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    pub(super) fn compile_throw(&mut self, value: Option<&Expr>, as_void: bool) -> Result<(), CompileError> {
        match value {
            None => {
                let variable = self.exception_for_rethrow.last().cloned().ok_or(CompileError::RethrowOutsideCatch)?;
                self.compile_get_variable(&variable)?;
                self.instructions.emit(if as_void { Instruction::RethrowVoid } else { Instruction::Rethrow });
            }
            Some(value) => {
                self.compile(value)?;
                self.instructions.emit(if as_void { Instruction::ThrowVoid } else { Instruction::Throw });
            }
        }
        Ok(())
    }

    pub(super) fn compile_try(&mut self, try_expr: &TryExpr) -> Result<(), CompileError> {
        let has_value = !try_expr.ty.is_void();

        if try_expr.handlers.iter().any(|h| h.filter.is_some()) {
            return Err(CompileError::unsupported("catch filter"));
        }
        if let Some(fault) = &try_expr.fault {
            if !try_expr.handlers.is_empty() || try_expr.finally.is_some() {
                return Err(CompileError::unsupported("fault block combined with other handlers"));
            }
            return self.compile_fault_region(&try_expr.body, fault, has_value);
        }
        if let [handler] = try_expr.handlers.as_slice() {
            if try_expr.finally.is_none() && is_catch_all_rethrow(handler) {
                let body = strip_trailing_rethrow(&handler.body);
                if !contains_rethrow(&body) {
                    return self.compile_fault_region(&try_expr.body, &body, has_value);
                }
            }
        }
        if try_expr.handlers.is_empty() && try_expr.finally.is_none() {
            return self.compile_maybe_void(&try_expr.body, !has_value);
        }

        let end = self.instructions.make_label();
        let goto_end = self.instructions.make_label();
        let try_start = self.instructions.count();

        let finally_label = match &try_expr.finally {
            Some(_) => {
                let label = self.instructions.make_label();
                self.instructions.emit_enter_try_finally(label);
                Some(label)
            }
            None => None,
        };

        self.labels.push(LabelScopeKind::Try);
        self.compile_maybe_void(&try_expr.body, !has_value)?;
        let try_end = self.instructions.count();

        self.instructions.mark_label(goto_end)?;
        self.instructions.emit_goto(end, has_value, has_value);

        for handler in &try_expr.handlers {
            let class = match &handler.class {
                Type::Exception(class) => Arc::clone(class),
                other => return Err(CompileError::unsupported(format!("catch of {}", other))),
            };
            self.labels.push(LabelScopeKind::Catch);
            let variable = handler.variable.clone().unwrap_or_else(|| Variable::anonymous(handler.class.clone()));
            let definition = self.locals.define_local(&variable, self.instructions.count())?;
            self.exception_for_rethrow.push(variable.clone());

            // The body's value, if any, is replaced by the exception.
            self.instructions.emit(Instruction::EnterExceptionHandler { has_value });
            let label_index = self.instructions.mark_runtime_label()?;
            let handler_start = self.instructions.count();

            // Gives boxing an initializer to rewrite when a lambda in the
            // handler captures the variable.
            self.instructions.emit(Instruction::InitializeLocal {
                index: definition.index(),
                init: LocalInit::Value(Value::Null),
            });
            self.compile_set_variable(&variable, true)?;
            self.compile_maybe_void(&handler.body, !has_value)?;
            self.instructions.emit_leave_exception_handler(has_value, goto_end);
            let handler_end = self.instructions.count();

            self.handlers.push(ExceptionHandler {
                start: try_start,
                end: try_end,
                label_index: label_index as usize,
                handler_start,
                handler_end,
                class: Some(class),
            });
            self.exception_for_rethrow.pop();
            self.locals.undefine_local(&definition, self.instructions.count());
            self.labels.pop(LabelScopeKind::Catch);
        }

        if let (Some(finally), Some(finally_label)) = (&try_expr.finally, finally_label) {
            self.labels.push(LabelScopeKind::Finally);
            self.instructions.mark_label(finally_label)?;
            self.instructions.emit(Instruction::EnterFinally);
            self.compile_as_void(finally)?;
            self.instructions.emit(Instruction::LeaveFinally);
            self.labels.pop(LabelScopeKind::Finally);
        }

        self.instructions.mark_label(end)?;
        self.labels.pop(LabelScopeKind::Try);
        Ok(())
    }

    /// `try { body } fault { handler }`: the handler matches every fault,
    /// runs with the exception on the stack and keeps unwinding.
    fn compile_fault_region(&mut self, body: &Expr, fault: &Expr, has_value: bool) -> Result<(), CompileError> {
        let end = self.instructions.make_label();
        let try_start = self.instructions.count();

        self.labels.push(LabelScopeKind::Try);
        self.compile_maybe_void(body, !has_value)?;
        let try_end = self.instructions.count();
        self.instructions.emit_goto(end, has_value, has_value);

        self.labels.push(LabelScopeKind::Finally);
        self.instructions.emit(Instruction::EnterExceptionHandler { has_value });
        let label_index = self.instructions.mark_runtime_label()?;
        let handler_start = self.instructions.count();
        // The exception is on the stack, not in a variable a rethrow could
        // name.
        let outer_catches = std::mem::take(&mut self.exception_for_rethrow);
        let compiled = self.compile_as_void(fault);
        self.exception_for_rethrow = outer_catches;
        compiled?;
        self.instructions.emit(Instruction::LeaveFault { has_value });
        let handler_end = self.instructions.count();
        self.labels.pop(LabelScopeKind::Finally);

        self.handlers.push(ExceptionHandler {
            start: try_start,
            end: try_end,
            label_index: label_index as usize,
            handler_start,
            handler_end,
            class: None,
        });
        self.instructions.mark_label(end)?;
        self.labels.pop(LabelScopeKind::Try);
        Ok(())
    }
}

fn is_empty(expr: &Expr) -> bool {
    matches!(expr, Expr::Default(ty) if ty.is_void())
}

fn is_rethrow(expr: &Expr) -> bool {
    match expr {
        Expr::Throw { value: None, .. } => true,
        Expr::Block(block) => block.expressions.last().is_some_and(is_rethrow),
        _ => false,
    }
}

fn contains_rethrow(expr: &Expr) -> bool {
    matches!(expr, Expr::Throw { value: None, .. }) || expr.children().into_iter().any(contains_rethrow)
}

/// `catch (Exception) { ...; rethrow; }` with nothing else to it.
fn is_catch_all_rethrow(handler: &CatchBlock) -> bool {
    matches!(&handler.class, Type::Exception(class) if class.parent().is_none())
        && handler.variable.is_none()
        && handler.filter.is_none()
        && is_rethrow(&handler.body)
}

/// The handler body without its final rethrow, as a void statement.
fn strip_trailing_rethrow(body: &Expr) -> Expr {
    match body {
        Expr::Block(block) => {
            let mut expressions = block.expressions.clone();
            if let Some(last) = expressions.pop() {
                expressions.push(strip_trailing_rethrow(&last));
            }
            Expr::Block(Box::new(BlockExpr { variables: block.variables.clone(), expressions, ty: Type::Void }))
        }
        _ => Expr::empty(),
    }
}

/// Jump targets and label definitions in `expr`, not looking into nested
/// lambdas.
fn collect_labels(expr: &Expr, gotos: &mut Vec<LabelTarget>, defined: &mut HashSet<LabelTarget>) {
    match expr {
        Expr::Goto { target, .. } => gotos.push(target.clone()),
        Expr::Label { target, .. } => {
            defined.insert(target.clone());
        }
        Expr::Loop(looped) => {
            defined.extend(looped.break_label.iter().cloned());
            defined.extend(looped.continue_label.iter().cloned());
        }
        _ => {}
    }
    for child in expr.children() {
        collect_labels(child, gotos, defined);
    }
}
