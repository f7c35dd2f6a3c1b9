//! The native tier: expression trees compiled to nested Rust closures.
//!
//! Each node becomes a [`Thunk`] that evaluates it against an [`Env`] of
//! local slots. Variables captured by nested lambdas live in cells, so the
//! compiled code shares them with delegates exactly like the interpreter
//! does. Loops lifted out of an interpreted frame run on a copy of the
//! frame's slots and write the bound ones back when they exit.

mod analysis;
mod flow;
mod lower;

use crate::tiering::{
    LocalBinding, LoopBindings, LoopExit, LoopFrame, NativeCompileError, NativeLambda, NativeLoop, TreeCompiler,
};
use crate::tree::{LambdaExpr, LoopExpr, Variable};
use crate::types::Signature;
use crate::values::{Value, ValueRef};
use crate::vm::{ExecutionContext, Fault};
use hashbrown::HashMap;
use lower::{Builder, VarLoc};
use std::sync::Arc;
use tracing::debug;

/// How evaluation of a node ended, other than with a value.
pub(crate) enum Exit {
    Fault(Fault),
    /// A jump to the label with this id, unwinding to whoever owns it.
    Jump { label: u64, value: Option<Value> },
}

impl From<Fault> for Exit {
    fn from(fault: Fault) -> Self {
        Exit::Fault(fault)
    }
}

pub(crate) struct Env<'a> {
    pub(crate) slots: Vec<Value>,
    pub(crate) closure: &'a [ValueRef],
}

pub(crate) type Thunk = Box<dyn Fn(&mut Env<'_>, &mut ExecutionContext) -> Result<Value, Exit> + Send + Sync>;

/// Boxes a node closure. The bound pins down the closure's signature.
pub(crate) fn thunk<F>(f: F) -> Thunk
where
    F: Fn(&mut Env<'_>, &mut ExecutionContext) -> Result<Value, Exit> + Send + Sync + 'static,
{
    Box::new(f)
}

/// The [`TreeCompiler`] engines use by default.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClosureCompiler;

impl ClosureCompiler {
    pub fn new() -> Self {
        Self
    }

    fn lambda(&self, lambda: &LambdaExpr, closure_variables: &[Variable]) -> Result<Arc<CompiledLambda>, NativeCompileError> {
        let mut builder = Builder::for_lambda(lambda, closure_variables);
        let params = lambda
            .params
            .iter()
            .map(|param| {
                let (location, _) = builder.define(param);
                location
            })
            .collect();
        let body = builder.compile(&lambda.body)?;
        Ok(Arc::new(CompiledLambda {
            name: Arc::clone(&lambda.name),
            signature: lambda.signature(),
            params,
            slot_count: builder.slot_count(),
            returns_value: !lambda.ret.is_void(),
            body,
        }))
    }
}

impl TreeCompiler for ClosureCompiler {
    fn compile_lambda(
        &self,
        lambda: &Arc<LambdaExpr>,
        closure_variables: &[Variable],
    ) -> Result<Arc<dyn NativeLambda>, NativeCompileError> {
        debug!(lambda = %lambda.name, captured = closure_variables.len(), "Compiling lambda to closures");
        Ok(self.lambda(lambda, closure_variables)?)
    }

    fn compile_loop(
        &self,
        loop_expr: &Arc<LoopExpr>,
        bindings: &LoopBindings,
    ) -> Result<Arc<dyn NativeLoop>, NativeCompileError> {
        let mut builder = Builder::for_loop(&loop_expr.body, bindings);
        let body = builder.compile_loop(loop_expr, false)?;
        let mut bound_slots: Vec<usize> = bindings
            .variables
            .values()
            .filter_map(|binding| match binding {
                LocalBinding::Slot { index, boxed: false } => Some(*index as usize),
                _ => None,
            })
            .collect();
        bound_slots.sort_unstable();
        debug!(bound = bound_slots.len(), exits = bindings.labels.len(), "Compiling loop to closures");
        Ok(Arc::new(CompiledLoop {
            body,
            slot_count: builder.slot_count(),
            bound_slots,
            labels: bindings.labels.iter().map(|(target, index)| (target.id(), *index)).collect(),
        }))
    }
}

struct CompiledLambda {
    name: Arc<str>,
    signature: Signature,
    params: Vec<VarLoc>,
    slot_count: usize,
    returns_value: bool,
    body: Thunk,
}

impl NativeLambda for CompiledLambda {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn call(&self, ctx: &mut ExecutionContext, closure: &[ValueRef], args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.params.len() {
            return Err(Fault::argument(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.params.len(),
                args.len()
            )));
        }
        ctx.enter_native(&self.name)?;

        let mut env = Env { slots: vec![Value::Null; self.slot_count], closure };
        for (location, arg) in self.params.iter().zip(args) {
            match (location, arg) {
                (VarLoc::Boxed(slot), Value::Ref(_)) => env.slots[*slot] = arg.clone(),
                (location, arg) => lower::initialize(&mut env, *location, arg.clone()),
            }
        }

        let result = match (self.body)(&mut env, ctx) {
            Ok(value) => Ok(if self.returns_value { value } else { Value::Null }),
            Err(Exit::Fault(fault)) => {
                fault.exception().set_stack_trace_if_absent(|| ctx.stack_trace());
                Err(fault)
            }
            Err(Exit::Jump { label, .. }) => Err(Fault::internal(format!("jump to label {} escaped {}", label, self.name))),
        };
        ctx.leave_frame();
        result
    }
}

struct CompiledLoop {
    body: Thunk,
    slot_count: usize,
    /// Unboxed frame slots the loop reads and writes.
    bound_slots: Vec<usize>,
    /// Label id to runtime label of the enclosing code.
    labels: HashMap<u64, usize>,
}

impl NativeLoop for CompiledLoop {
    fn run(&self, ctx: &mut ExecutionContext, frame: &mut LoopFrame<'_>) -> Result<LoopExit, Fault> {
        let mut slots = frame.locals.to_vec();
        if slots.len() < self.slot_count {
            slots.resize(self.slot_count, Value::Null);
        }
        let mut env = Env { slots, closure: frame.closure };
        let result = (self.body)(&mut env, ctx);

        // Faults included: handlers in the frame see the loop's writes.
        for &index in &self.bound_slots {
            if let (Some(local), Some(value)) = (frame.locals.get_mut(index), env.slots.get(index)) {
                *local = value.clone();
            }
        }

        match result {
            Err(Exit::Jump { label, value }) => match self.labels.get(&label) {
                Some(index) => Ok(LoopExit::Goto { label: *index, value }),
                None => Err(Fault::internal(format!("compiled loop jumped to unknown label {}", label))),
            },
            Err(Exit::Fault(fault)) => Err(fault),
            Ok(_) => Err(Fault::internal("compiled loop finished without a jump")),
        }
    }
}

static_assertions::assert_impl_all!(ClosureCompiler: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Expr, LabelTarget};
    use crate::types::Type;
    use crate::values::Function;
    use pretty_assertions::assert_eq;

    fn compile(lambda: &Arc<LambdaExpr>) -> Arc<dyn NativeLambda> {
        ClosureCompiler::new().compile_lambda(lambda, &[]).expect("compiles")
    }

    fn call(compiled: &Arc<dyn NativeLambda>, args: &[Value]) -> Result<Value, Fault> {
        compiled.call(&mut ExecutionContext::new(), &[], args)
    }

    #[test]
    fn test_sum_loop() {
        crate::test_utils::init_test_logging();
        let n = Variable::new("n", Type::Int);
        let i = Variable::new("i", Type::Int);
        let total = Variable::new("total", Type::Int);
        let done = LabelTarget::typed("done", Type::Int);
        let body = Expr::block(
            vec![i.clone(), total.clone()],
            vec![Expr::loop_(
                Expr::if_then_else(
                    Expr::less_than(Expr::param(&i), Expr::param(&n)),
                    Expr::void_block(
                        vec![],
                        vec![
                            Expr::assign(Expr::param(&i), Expr::add(Expr::param(&i), Expr::int(1))),
                            Expr::assign(Expr::param(&total), Expr::add(Expr::param(&total), Expr::param(&i))),
                        ],
                    ),
                    Expr::break_(&done, Some(Expr::param(&total))),
                ),
                Some(done.clone()),
                None,
            )],
        );
        let lambda = LambdaExpr::new("sum", vec![n], body);
        let compiled = compile(&lambda);
        assert_eq!(call(&compiled, &[Value::Int(10)]).ok(), Some(Value::Int(55)));
        assert_eq!(call(&compiled, &[Value::Int(0)]).ok(), Some(Value::Int(0)));
    }

    #[test]
    fn test_closure_shares_cell_with_outer_lambda() {
        let x = Variable::new("x", Type::Int);
        let setter = LambdaExpr::new("set", vec![], Expr::assign(Expr::param(&x), Expr::int(2)));
        let body = Expr::block(
            vec![x.clone()],
            vec![
                Expr::assign(Expr::param(&x), Expr::int(1)),
                Expr::invoke(Expr::lambda(&setter), vec![]),
                Expr::param(&x),
            ],
        );
        let compiled = compile(&LambdaExpr::new("outer", vec![], body));
        assert_eq!(call(&compiled, &[]).ok(), Some(Value::Int(2)));
    }

    #[test]
    fn test_jump_into_nested_block_is_rejected() {
        let inner = LabelTarget::new("inner");
        let body =
            Expr::void_block(vec![], vec![Expr::goto(&inner), Expr::void_block(vec![], vec![Expr::label(&inner, None)])]);
        let result = ClosureCompiler::new().compile_lambda(&LambdaExpr::new("f", vec![], body), &[]);
        assert!(matches!(result, Err(NativeCompileError::InvalidJump { .. })));
    }

    #[test]
    fn test_returned_delegate_is_callable() {
        let x = Variable::new("x", Type::Int);
        let adder = LambdaExpr::new("add_x", vec![], Expr::add(Expr::param(&x), Expr::int(1)));
        let outer = LambdaExpr::new("outer", vec![x], Expr::lambda(&adder));
        let compiled = compile(&outer);
        let delegate = call(&compiled, &[Value::Int(41)]).expect("runs");
        let function = delegate.as_function().expect("a function");
        assert_eq!(function.call(&mut ExecutionContext::new(), &[]).ok(), Some(Value::Int(42)));
    }
}
