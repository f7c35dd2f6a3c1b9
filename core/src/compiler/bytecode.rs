//! Lowers expression trees to the interpreter's instruction stream.
//!
//! One [`BytecodeCompiler`] lowers one lambda. Nested lambdas get their own
//! compiler with a link to the enclosing one, which is how free variables
//! are resolved: the defining compiler boxes the variable (rewriting the
//! accesses it has already emitted) and every compiler in between records
//! it as a closure variable.
//!
//! Control flow lives in `control.rs`; this file holds the driver, variable
//! access and the data-flow nodes.

use super::labels::LabelScopes;
use super::locals::{LocalVariable, LocalVariables};
use super::CompileError;
use crate::tiering::{DelegateCreator, LocalBinding, LoopBindings, LoopTier, TieringSettings};
use crate::tree::{BinaryOp, Expr, LabelTarget, LambdaExpr, LoopExpr, UnaryOp, Variable};
use crate::types::{MethodKind, Type};
use crate::vm::{
    ArithOp, BitOp, Code, ComparisonOp, Conversion, DebugInfo, ExceptionHandler, Instruction, InstructionList,
    LocalInit,
};
use hashbrown::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves variables a nested lambda does not define itself.
pub(crate) trait ClosureResolver {
    /// Makes `variable` reachable from a nested lambda: boxes it where it is
    /// defined, or registers it as a closure variable here.
    fn ensure_available_for_closure(&mut self, variable: &Variable) -> Result<(), CompileError>;
}

/// A loop header waiting for its tier until boxing is final.
pub(super) struct PendingLoop {
    pub(super) instruction: usize,
    pub(super) expr: Arc<LoopExpr>,
    pub(super) scopes: Vec<(Variable, usize)>,
    pub(super) labels: HashMap<LabelTarget, usize>,
}

pub struct BytecodeCompiler<'a> {
    pub(super) settings: &'a TieringSettings,
    parent: Option<&'a mut (dyn ClosureResolver + 'a)>,
    pub(super) instructions: InstructionList,
    pub(super) locals: LocalVariables,
    pub(super) labels: LabelScopes,
    pub(super) handlers: Vec<ExceptionHandler>,
    pub(super) debug_infos: Vec<DebugInfo>,
    /// Exception variables of the enclosing catch blocks, innermost last.
    pub(super) exception_for_rethrow: Vec<Variable>,
    pub(super) pending_loops: Vec<PendingLoop>,
    /// The lambda must go straight to the native tier.
    pub(super) force_compile: bool,
}

impl<'a> BytecodeCompiler<'a> {
    fn new(settings: &'a TieringSettings, parent: Option<&'a mut (dyn ClosureResolver + 'a)>) -> Self {
        Self {
            settings,
            parent,
            instructions: InstructionList::new(),
            locals: LocalVariables::new(),
            labels: LabelScopes::new(),
            handlers: Vec::new(),
            debug_infos: Vec::new(),
            exception_for_rethrow: Vec::new(),
            pending_loops: Vec::new(),
            force_compile: false,
        }
    }

    /// Lowers a top-level lambda. Free variables are an error here.
    pub fn lower_tree(lambda: &Arc<LambdaExpr>, settings: &TieringSettings) -> Result<Arc<DelegateCreator>, CompileError> {
        let mut compiler = BytecodeCompiler::new(settings, None);
        compiler.compile_top(lambda)?;
        compiler.finish(lambda)
    }

    fn compile_top(&mut self, lambda: &LambdaExpr) -> Result<(), CompileError> {
        // Parameters take slots 0..n; the caller writes the arguments there.
        for param in &lambda.params {
            let definition = self.locals.define_local(param, 0)?;
            self.instructions.emit(Instruction::InitializeLocal { index: definition.index(), init: LocalInit::Parameter });
            if param.is_by_ref() {
                // The argument already is a cell shared with the caller.
                self.locals.mark_boxed(&definition);
                self.force_compile = true;
            }
        }

        if lambda.ret.is_void() {
            self.compile_as_void(&lambda.body)?;
        } else if lambda.body.ty().is_void() {
            return Err(CompileError::unsupported(format!(
                "lambda '{}' returns {} but its body is void",
                lambda.name, lambda.ret
            )));
        } else {
            self.compile(&lambda.body)?;
        }

        let expected = !lambda.ret.is_void() as usize;
        let actual = self.instructions.current_stack_depth();
        if actual != expected {
            return Err(CompileError::StackDepth { node: format!("lambda {}", lambda.name), expected, actual });
        }
        Ok(())
    }

    /// Freezes the stream into [`Code`] and wraps it in a delegate creator.
    fn finish(mut self, lambda: &Arc<LambdaExpr>) -> Result<Arc<DelegateCreator>, CompileError> {
        self.labels.validate_finish()?;

        let settings = self.settings;
        let (threshold, synchronous) = if self.force_compile {
            (0, true)
        } else {
            (settings.compilation_threshold, settings.compile_synchronously)
        };

        let mut label_mapping = HashMap::new();
        let tier_loops = settings.loop_tiering && !self.force_compile && threshold >= 0;
        for pending in std::mem::take(&mut self.pending_loops) {
            label_mapping.extend(pending.labels.iter().map(|(target, index)| (target.clone(), *index)));
            if !tier_loops {
                continue;
            }
            let mut variables = HashMap::new();
            for (variable, scope) in &pending.scopes {
                let local = self.locals.resolve(*scope);
                variables.insert(variable.clone(), LocalBinding::Slot { index: local.index, boxed: local.is_boxed });
            }
            for (i, variable) in self.locals.closure_variables().iter().enumerate() {
                variables.entry(variable.clone()).or_insert(LocalBinding::Closure(i as u32));
            }
            let bindings = LoopBindings { variables, labels: pending.labels };
            let tier = LoopTier::new(&lambda.name, pending.expr, bindings, settings);
            self.instructions.replace(pending.instruction, Instruction::EnterLoop(Some(Arc::new(tier))));
        }

        let num_locals = self.locals.local_count();
        let closure_variables = self.locals.closure_variables().to_vec();
        let array = self.instructions.finalize()?;
        debug!(
            lambda = %lambda.name,
            instructions = array.instructions.len(),
            locals = num_locals,
            max_stack = array.max_stack_depth,
            captures = closure_variables.len(),
            force_compile = self.force_compile,
            "Lowered lambda"
        );

        let code = Code {
            name: Arc::clone(&lambda.name),
            instructions: array.instructions,
            labels: array.labels,
            handlers: self.handlers.into_boxed_slice(),
            debug_infos: self.debug_infos.into_boxed_slice(),
            label_mapping,
            closure_variables,
            arity: lambda.params.len(),
            num_locals,
            max_stack_size: array.max_stack_depth,
            max_continuation_depth: array.max_continuation_depth,
            compilation_threshold: threshold,
            force_compile: self.force_compile,
            returns_value: !lambda.ret.is_void(),
        };
        Ok(DelegateCreator::new(Arc::new(code), Arc::clone(lambda), threshold, synchronous, settings))
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Lowers `expr` so that it leaves exactly its value on the stack (none
    /// for void nodes).
    pub(super) fn compile(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let start = self.instructions.current_stack_depth();
        let pushed = self.labels.try_push(expr)?;
        self.compile_no_label_push(expr)?;
        if let Some(kind) = pushed {
            self.labels.pop(kind);
        }

        let expected = start + !expr.ty().is_void() as usize;
        let actual = self.instructions.current_stack_depth();
        if actual != expected {
            return Err(CompileError::StackDepth { node: format!("{:?}", expr.kind()), expected, actual });
        }
        Ok(())
    }

    /// Lowers `expr` for its effects only.
    pub(super) fn compile_as_void(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let start = self.instructions.current_stack_depth();
        let pushed = self.labels.try_push(expr)?;
        match expr {
            Expr::Assign { target, value } => self.compile_assign(target, value, true)?,
            Expr::Block(block) => self.compile_block(block, true)?,
            Expr::Throw { value, .. } => self.compile_throw(value.as_deref(), true)?,
            Expr::Constant { .. } | Expr::Default(_) | Expr::Parameter(_) => {}
            _ => {
                self.compile_no_label_push(expr)?;
                if !expr.ty().is_void() {
                    self.instructions.emit(Instruction::Pop);
                }
            }
        }
        if let Some(kind) = pushed {
            self.labels.pop(kind);
        }

        let actual = self.instructions.current_stack_depth();
        if actual != start {
            return Err(CompileError::StackDepth { node: format!("{:?} (void)", expr.kind()), expected: start, actual });
        }
        Ok(())
    }

    pub(super) fn compile_maybe_void(&mut self, expr: &Expr, as_void: bool) -> Result<(), CompileError> {
        if as_void { self.compile_as_void(expr) } else { self.compile(expr) }
    }

    fn compile_no_label_push(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Constant { value, .. } => {
                self.instructions.emit(Instruction::Push(value.clone()));
            }
            Expr::Default(ty) => {
                if !ty.is_void() {
                    self.instructions.emit(Instruction::Push(ty.default_value()));
                }
            }
            Expr::Parameter(variable) => self.compile_get_variable(variable)?,
            Expr::Binary { op: BinaryOp::AndAlso, left, right } => self.compile_logical(left, right, true)?,
            Expr::Binary { op: BinaryOp::OrElse, left, right } => self.compile_logical(left, right, false)?,
            Expr::Binary { op, left, right } => self.compile_binary(*op, left, right)?,
            Expr::Unary { op, operand } => self.compile_unary(*op, operand)?,
            Expr::Assign { target, value } => self.compile_assign(target, value, false)?,
            Expr::Block(block) => self.compile_block(block, block.ty.is_void())?,
            Expr::Conditional { test, if_true, if_false, ty } => {
                self.compile_conditional(test, if_true, if_false, ty.is_void())?
            }
            Expr::Loop(looped) => self.compile_loop(looped)?,
            Expr::Goto { target, value, ty, .. } => self.compile_goto(target, value.as_deref(), ty)?,
            Expr::Label { target, default } => self.compile_label(target, default.as_deref())?,
            Expr::Switch(switch) => self.compile_switch(switch)?,
            Expr::Try(try_expr) => self.compile_try(try_expr)?,
            Expr::Throw { value, ty } => self.compile_throw(value.as_deref(), ty.is_void())?,
            Expr::Lambda(lambda) => self.compile_lambda(lambda)?,
            Expr::Invoke { callee, args } => {
                self.compile(callee)?;
                for arg in args {
                    self.compile(arg)?;
                }
                let void = expr.ty().is_void();
                self.instructions.emit(Instruction::Invoke { arg_count: args.len() as u32, void });
            }
            Expr::Call { method, instance, args } => self.compile_call(method, instance.as_deref(), args)?,
            Expr::New { class, args } => {
                if args.len() != class.fields().len() {
                    return Err(CompileError::unsupported(format!(
                        "new {} with {} arguments for {} fields",
                        class.name(),
                        args.len(),
                        class.fields().len()
                    )));
                }
                for arg in args {
                    self.compile(arg)?;
                }
                self.instructions.emit(Instruction::New { class: Arc::clone(class), arg_count: args.len() as u32 });
            }
            Expr::Field { target, class, index } => {
                if *index >= class.fields().len() {
                    return Err(CompileError::unsupported(format!("unknown field of {}", class.name())));
                }
                self.compile(target)?;
                self.instructions.emit(Instruction::LoadField(*index as u32));
            }
            Expr::NewArray { items, .. } => {
                for item in items {
                    self.compile(item)?;
                }
                self.instructions.emit(Instruction::NewArray(items.len() as u32));
            }
            Expr::NewArrayBounds { element, length } => {
                self.compile(length)?;
                self.instructions.emit(Instruction::NewArrayBounds(element.default_value()));
            }
            Expr::Index { array, index } => {
                self.compile(array)?;
                self.compile(index)?;
                self.instructions.emit(Instruction::LoadElement);
            }
            Expr::ArrayLength(array) => {
                self.compile(array)?;
                self.instructions.emit(Instruction::ArrayLength);
            }
            Expr::TypeIs { operand, ty } => {
                self.compile(operand)?;
                self.instructions.emit(Instruction::TypeIs(ty.clone()));
            }
            Expr::TypeAs { operand, ty } => {
                self.compile(operand)?;
                self.instructions.emit(Instruction::TypeAs(ty.clone()));
            }
            Expr::Convert { operand, ty } => self.compile_convert(operand, ty)?,
            Expr::Dynamic { site, args, ty } => {
                for arg in args {
                    self.compile(arg)?;
                }
                self.instructions.emit(Instruction::Dynamic {
                    site: Arc::clone(site),
                    arg_count: args.len() as u32,
                    void: ty.is_void(),
                });
            }
            Expr::DebugInfo(info) => {
                self.debug_infos.push(DebugInfo {
                    index: self.instructions.count(),
                    start_line: info.start_line,
                    end_line: info.end_line,
                    file: info.file.clone(),
                    is_clear: info.clear,
                });
            }
            Expr::Extension(_) => match expr.reduce() {
                Some(reduced) => self.compile(&reduced)?,
                None => return Err(CompileError::unsupported("extension node that does not reduce")),
            },
        }
        Ok(())
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn resolve_local(&mut self, variable: &Variable) -> Result<LocalVariable, CompileError> {
        if let Some(local) = self.locals.try_get_local_or_closure(variable) {
            return Ok(local);
        }
        self.ensure_available_for_closure(variable)?;
        self.locals
            .try_get_local_or_closure(variable)
            .ok_or_else(|| CompileError::UnboundVariable { name: variable.name().to_string() })
    }

    pub(super) fn compile_get_variable(&mut self, variable: &Variable) -> Result<(), CompileError> {
        let local = self.resolve_local(variable)?;
        let instruction = if local.in_closure {
            Instruction::LoadLocalFromClosure(local.index)
        } else if local.is_boxed {
            Instruction::LoadLocalBoxed(local.index)
        } else {
            Instruction::LoadLocal(local.index)
        };
        self.instructions.emit(instruction);
        Ok(())
    }

    /// Pushes the cell of a captured variable.
    fn compile_get_boxed_variable(&mut self, variable: &Variable) -> Result<(), CompileError> {
        let local = self.resolve_local(variable)?;
        if local.in_closure {
            self.instructions.emit(Instruction::LoadLocalFromClosureBoxed(local.index));
        } else if local.is_boxed {
            // Emitted after boxing, so this plain load reads the cell.
            self.instructions.emit(Instruction::LoadLocal(local.index));
        } else {
            return Err(CompileError::unsupported(format!("captured variable '{}' is not boxed", variable.name())));
        }
        Ok(())
    }

    pub(super) fn compile_set_variable(&mut self, variable: &Variable, as_void: bool) -> Result<(), CompileError> {
        let local = self.resolve_local(variable)?;
        let index = local.index;
        let instruction = match (local.in_closure, local.is_boxed, as_void) {
            (true, _, true) => Instruction::StoreLocalToClosure(index),
            (true, _, false) => Instruction::AssignLocalToClosure(index),
            (false, true, true) => Instruction::StoreLocalBoxed(index),
            (false, true, false) => Instruction::AssignLocalBoxed(index),
            (false, false, true) => Instruction::StoreLocal(index),
            (false, false, false) => Instruction::AssignLocal(index),
        };
        self.instructions.emit(instruction);
        Ok(())
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr, as_void: bool) -> Result<(), CompileError> {
        match target {
            Expr::Parameter(variable) => {
                self.compile(value)?;
                self.compile_set_variable(variable, as_void)
            }
            Expr::Field { target: object, class, index } => {
                if *index >= class.fields().len() {
                    return Err(CompileError::unsupported(format!("unknown field of {}", class.name())));
                }
                self.compile(object)?;
                self.compile(value)?;
                self.store_keeping_value(Instruction::StoreField(*index as u32), value.ty(), as_void)
            }
            Expr::Index { array, index } => {
                self.compile(array)?;
                self.compile(index)?;
                self.compile(value)?;
                self.store_keeping_value(Instruction::StoreElement, value.ty(), as_void)
            }
            other => Err(CompileError::unsupported(format!("assignment to {:?}", other.kind()))),
        }
    }

    /// Emits a consuming store; when the assignment's value is used, parks
    /// it in a temporary and reloads it after the store.
    fn store_keeping_value(&mut self, store: Instruction, ty: Type, as_void: bool) -> Result<(), CompileError> {
        if as_void {
            self.instructions.emit(store);
            return Ok(());
        }
        let temp = Variable::anonymous(ty);
        let definition = self.locals.define_local(&temp, self.instructions.count())?;
        self.instructions.emit(Instruction::AssignLocal(definition.index()));
        self.instructions.emit(store);
        self.instructions.emit(Instruction::LoadLocal(definition.index()));
        self.locals.undefine_local(&definition, self.instructions.count());
        Ok(())
    }

    // ========================================================================
    // Blocks and lambdas
    // ========================================================================

    pub(super) fn compile_block(&mut self, block: &crate::tree::BlockExpr, as_void: bool) -> Result<(), CompileError> {
        let start = self.instructions.count();
        let mut definitions = Vec::with_capacity(block.variables.len());
        for variable in &block.variables {
            let definition = self.locals.define_local(variable, start)?;
            self.instructions.emit(Instruction::InitializeLocal {
                index: definition.index(),
                init: LocalInit::Value(variable.ty().default_value()),
            });
            definitions.push(definition);
        }

        match block.expressions.split_last() {
            Some((last, rest)) => {
                for expression in rest {
                    self.compile_as_void(expression)?;
                }
                self.compile_maybe_void(last, as_void)?;
            }
            None if !as_void => return Err(CompileError::unsupported("empty block with a value")),
            None => {}
        }

        let end = self.instructions.count();
        for definition in &definitions {
            self.locals.undefine_local(definition, end);
        }
        Ok(())
    }

    fn compile_lambda(&mut self, lambda: &Arc<LambdaExpr>) -> Result<(), CompileError> {
        let settings = self.settings;
        let (creator, captured) = {
            let mut child = BytecodeCompiler::new(settings, Some(self as &mut dyn ClosureResolver));
            child.compile_top(lambda)?;
            let captured = child.locals.closure_variables().to_vec();
            (child.finish(lambda)?, captured)
        };
        trace!(lambda = %lambda.name, captures = captured.len(), "Nested lambda lowered");

        for variable in &captured {
            self.compile_get_boxed_variable(variable)?;
        }
        self.instructions.emit(Instruction::CreateDelegate { creator, captures: captured.len() as u32 });
        Ok(())
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        let left_type = left.ty();
        let right_type = right.ty();

        let instruction = match op {
            BinaryOp::Equal => Instruction::Equal,
            BinaryOp::NotEqual => Instruction::NotEqual,
            _ if left_type != right_type => {
                return Err(CompileError::unsupported(format!("{:?} of {} and {}", op, left_type, right_type)));
            }
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => {
                let arith = match op {
                    BinaryOp::Add => ArithOp::Add,
                    BinaryOp::Subtract => ArithOp::Sub,
                    BinaryOp::Multiply => ArithOp::Mul,
                    BinaryOp::Divide => ArithOp::Div,
                    _ => ArithOp::Rem,
                };
                match left_type {
                    Type::Int => Instruction::IntBinOp(arith),
                    Type::Float => Instruction::FloatBinOp(arith),
                    Type::Str if arith == ArithOp::Add => Instruction::StringConcat,
                    other => return Err(CompileError::unsupported(format!("{:?} of {}", op, other))),
                }
            }
            BinaryOp::LessThan | BinaryOp::LessThanOrEqual | BinaryOp::GreaterThan | BinaryOp::GreaterThanOrEqual => {
                let comparison = match op {
                    BinaryOp::LessThan => ComparisonOp::Less,
                    BinaryOp::LessThanOrEqual => ComparisonOp::LessEqual,
                    BinaryOp::GreaterThan => ComparisonOp::Greater,
                    _ => ComparisonOp::GreaterEqual,
                };
                match left_type {
                    Type::Int => Instruction::IntCmpOp(comparison),
                    Type::Float => Instruction::FloatCmpOp(comparison),
                    Type::Str => Instruction::StringCmpOp(comparison),
                    other => return Err(CompileError::unsupported(format!("ordering of {}", other))),
                }
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::ExclusiveOr => {
                if !matches!(left_type, Type::Int | Type::Bool) {
                    return Err(CompileError::unsupported(format!("{:?} of {}", op, left_type)));
                }
                Instruction::BitOp(match op {
                    BinaryOp::And => BitOp::And,
                    BinaryOp::Or => BitOp::Or,
                    _ => BitOp::Xor,
                })
            }
            BinaryOp::AndAlso | BinaryOp::OrElse => {
                return Err(CompileError::unsupported("short-circuit operator outside a branch"));
            }
        };

        self.compile(left)?;
        self.compile(right)?;
        self.instructions.emit(instruction);
        Ok(())
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<(), CompileError> {
        let ty = operand.ty();
        let instruction = match (op, &ty) {
            (UnaryOp::Negate, Type::Int) => Instruction::NegInt,
            (UnaryOp::Negate, Type::Float) => Instruction::NegFloat,
            (UnaryOp::Not, Type::Bool) => Instruction::Not,
            (UnaryOp::Not, Type::Int) | (UnaryOp::OnesComplement, Type::Int) => Instruction::BitNot,
            _ => return Err(CompileError::unsupported(format!("{:?} of {}", op, ty))),
        };
        self.compile(operand)?;
        self.instructions.emit(instruction);
        Ok(())
    }

    fn compile_convert(&mut self, operand: &Expr, ty: &Type) -> Result<(), CompileError> {
        if ty.is_void() {
            return self.compile_as_void(operand);
        }
        let from = operand.ty();
        self.compile(operand)?;
        let instruction = match (&from, ty) {
            (from, to) if from == to => return Ok(()),
            (Type::Int, Type::Float) => Instruction::Convert(Conversion::IntToFloat),
            (Type::Float, Type::Int) => Instruction::Convert(Conversion::FloatToInt),
            (Type::Bool, Type::Int) => Instruction::Convert(Conversion::BoolToInt),
            (_, Type::Str) => Instruction::Convert(Conversion::ToStr),
            (_, Type::Any) => return Ok(()),
            _ => Instruction::Cast(ty.clone()),
        };
        self.instructions.emit(instruction);
        Ok(())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn compile_call(
        &mut self,
        method: &Arc<crate::types::Method>,
        instance: Option<&Expr>,
        args: &[Expr],
    ) -> Result<(), CompileError> {
        if args.len() != method.params().len() {
            return Err(CompileError::unsupported(format!(
                "call of {} with {} arguments, expected {}",
                method.name(),
                args.len(),
                method.params().len()
            )));
        }
        match (method.has_receiver(), instance) {
            (true, Some(instance)) => self.compile(instance)?,
            (false, None) => {}
            (true, None) => {
                return Err(CompileError::unsupported(format!("instance method {} without receiver", method.name())));
            }
            (false, Some(_)) => {
                return Err(CompileError::unsupported(format!("static method {} with a receiver", method.name())));
            }
        }
        for arg in args {
            self.compile(arg)?;
        }

        let write_back = method.has_by_ref_params();
        if write_back {
            self.force_compile = true;
        }
        self.instructions.emit(Instruction::Call {
            method: Arc::clone(method),
            virtual_dispatch: method.kind() == MethodKind::Virtual,
            write_back,
        });

        // Final by-ref values sit above the result, last parameter on top.
        if write_back {
            for (param, arg) in method.params().iter().zip(args).rev() {
                if !param.by_ref {
                    continue;
                }
                match arg {
                    Expr::Parameter(variable) => self.compile_set_variable(variable, true)?,
                    _ => {
                        self.instructions.emit(Instruction::Pop);
                    }
                }
            }
        }
        Ok(())
    }
}

impl ClosureResolver for BytecodeCompiler<'_> {
    fn ensure_available_for_closure(&mut self, variable: &Variable) -> Result<(), CompileError> {
        if let Some(local) = self.locals.try_get_local_or_closure(variable) {
            if !local.in_closure_or_boxed() {
                trace!(variable = variable.name(), "Boxing captured variable");
                self.locals.box_variable(variable, &mut self.instructions);
            }
            return Ok(());
        }
        match self.parent.as_deref_mut() {
            Some(parent) => {
                parent.ensure_available_for_closure(variable)?;
                self.locals.add_closure_variable(variable);
                Ok(())
            }
            None => Err(CompileError::UnboundVariable { name: variable.name().to_string() }),
        }
    }
}
