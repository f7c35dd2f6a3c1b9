//! The seam between the tiering controller and a native compiler.

use crate::tree::{LabelTarget, LambdaExpr, LoopExpr, Variable};
use crate::types::Signature;
use crate::values::{Function, Value, ValueRef};
use crate::vm::{ExecutionContext, Fault};
use hashbrown::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeCompileError {
    #[error("native tier does not support {0}")]
    Unsupported(String),

    #[error("variable '{name}' is not bound")]
    UnboundVariable { name: String },

    #[error("jump to label '{label}' cannot be compiled")]
    InvalidJump { label: String },
}

/// A lambda compiled to native code. Invoked with the closure cells of the
/// delegate it replaces.
pub trait NativeLambda: Send + Sync {
    fn signature(&self) -> &Signature;

    fn call(&self, ctx: &mut ExecutionContext, closure: &[ValueRef], args: &[Value]) -> Result<Value, Fault>;
}

/// State a compiled loop shares with the interpreted frame that entered it.
pub struct LoopFrame<'a> {
    pub locals: &'a mut [Value],
    pub closure: &'a [ValueRef],
}

/// Where the interpreter resumes after a compiled loop.
#[derive(Debug)]
pub enum LoopExit {
    /// Continue at a runtime label of the enclosing code, carrying the
    /// jump's value if it has one.
    Goto { label: usize, value: Option<Value> },
}

pub trait NativeLoop: Send + Sync {
    fn run(&self, ctx: &mut ExecutionContext, frame: &mut LoopFrame<'_>) -> Result<LoopExit, Fault>;
}

/// Where a variable used by a loop lives in the interpreted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalBinding {
    /// Frame slot; `boxed` slots hold a cell.
    Slot { index: u32, boxed: bool },
    /// Index into the closure array.
    Closure(u32),
}

/// Everything a loop compiler needs to know about the enclosing lambda.
#[derive(Clone, Debug, Default)]
pub struct LoopBindings {
    pub variables: HashMap<Variable, LocalBinding>,
    /// Runtime label of every label outside the loop a jump inside it
    /// targets, including the break label.
    pub labels: HashMap<LabelTarget, usize>,
}

/// Compiles trees to native callables.
pub trait TreeCompiler: Send + Sync {
    /// `closure_variables` lists the captured variables in closure-array
    /// order.
    fn compile_lambda(
        &self,
        lambda: &Arc<LambdaExpr>,
        closure_variables: &[Variable],
    ) -> Result<Arc<dyn NativeLambda>, NativeCompileError>;

    fn compile_loop(
        &self,
        _loop_expr: &Arc<LoopExpr>,
        _bindings: &LoopBindings,
    ) -> Result<Arc<dyn NativeLoop>, NativeCompileError> {
        Err(NativeCompileError::Unsupported("loop compilation".to_string()))
    }
}

/// A natively compiled lambda as a first-class function value.
pub struct NativeDelegate {
    name: Arc<str>,
    arity: usize,
    compiled: Arc<dyn NativeLambda>,
    closure: Option<Arc<[ValueRef]>>,
}

impl NativeDelegate {
    pub fn new(name: &Arc<str>, compiled: Arc<dyn NativeLambda>, closure: Option<Arc<[ValueRef]>>) -> Self {
        let arity = compiled.signature().params.len();
        Self { name: Arc::clone(name), arity, compiled, closure }
    }
}

impl Function for NativeDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> usize {
        self.arity
    }

    fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.arity {
            return Err(Fault::argument(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.arity,
                args.len()
            )));
        }
        self.compiled.call(ctx, self.closure.as_deref().unwrap_or(&[]), args)
    }
}
