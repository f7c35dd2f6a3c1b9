//! Interpreted lambdas that promote themselves once they get hot.

use super::native::{NativeCompileError, NativeLambda};
use super::{TieringSettings, TieringStats, TreeCompiler};
use crate::tree::LambdaExpr;
use crate::types::Signature;
use crate::values::{Callable, Function, Value, ValueRef};
use crate::vm::{Code, ExecutionContext, Fault, Frame, VM};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Lowered lambda plus its promotion state. One creator exists per lambda
/// node; every delegate created from it shares the counter and the
/// compiled callable.
pub struct DelegateCreator {
    code: Arc<Code>,
    lambda: Arc<LambdaExpr>,
    signature: Signature,
    compiler: Arc<dyn TreeCompiler>,
    synchronous: bool,
    /// Calls left before promotion. Negative once promotion has been
    /// triggered, or from the start when it is disabled.
    remaining: AtomicI32,
    compiled: OnceLock<Result<Arc<dyn NativeLambda>, NativeCompileError>>,
    compile_lock: Mutex<()>,
    stats: Arc<TieringStats>,
}

impl DelegateCreator {
    pub(crate) fn new(
        code: Arc<Code>,
        lambda: Arc<LambdaExpr>,
        threshold: i32,
        synchronous: bool,
        settings: &TieringSettings,
    ) -> Arc<Self> {
        let signature = lambda.signature();
        Arc::new(Self {
            code,
            lambda,
            signature,
            compiler: Arc::clone(&settings.compiler),
            synchronous,
            remaining: AtomicI32::new(threshold),
            compiled: OnceLock::new(),
            compile_lock: Mutex::new(()),
            stats: Arc::clone(&settings.stats),
        })
    }

    pub fn name(&self) -> &str {
        &self.lambda.name
    }

    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    pub fn lambda(&self) -> &Arc<LambdaExpr> {
        &self.lambda
    }

    /// A function value bound to `closure`.
    pub fn create_delegate(self: &Arc<Self>, closure: Option<Arc<[ValueRef]>>) -> Callable {
        Arc::new(LightLambda { creator: Arc::clone(self), closure })
    }

    pub fn is_compiled(&self) -> bool {
        self.try_get_compiled().is_some()
    }

    /// The compiled callable, if promotion finished and its signature is
    /// the lambda's.
    fn try_get_compiled(&self) -> Option<&Arc<dyn NativeLambda>> {
        match self.compiled.get() {
            Some(Ok(compiled)) if compiled.signature() == &self.signature => Some(compiled),
            _ => None,
        }
    }

    /// Counts one call. True for exactly the call that reaches zero.
    fn should_compile(&self) -> bool {
        self.remaining.load(Ordering::Relaxed) >= 0 && self.remaining.fetch_sub(1, Ordering::Relaxed) == 0
    }

    /// Compiles the lambda natively. Runs at most once; later calls return
    /// the recorded outcome, failures included.
    pub fn compile(&self) -> Result<Arc<dyn NativeLambda>, NativeCompileError> {
        if let Some(result) = self.compiled.get() {
            return result.clone();
        }
        let _guard = self.compile_lock.lock();
        if let Some(result) = self.compiled.get() {
            return result.clone();
        }

        let result = self.compiler.compile_lambda(&self.lambda, self.code.closure_variables());
        match &result {
            Ok(_) => {
                self.stats.record_completed();
                info!(lambda = self.name(), "Lambda promoted to the compiled tier");
            }
            Err(e) => {
                self.stats.record_failed();
                warn!(lambda = self.name(), error = %e, "Lambda compilation failed, staying interpreted");
            }
        }
        // The lock makes this the only writer.
        let _ = self.compiled.set(result.clone());
        result
    }

    fn trigger(self: &Arc<Self>) -> Option<Arc<dyn NativeLambda>> {
        self.stats.record_trigger();
        if self.synchronous {
            return self.compile().ok();
        }
        debug!(lambda = self.name(), "Scheduling background compilation");
        let creator = Arc::clone(self);
        rayon::spawn(move || {
            let _ = creator.compile();
        });
        None
    }
}

/// A delegate of an interpreted lambda.
pub struct LightLambda {
    creator: Arc<DelegateCreator>,
    closure: Option<Arc<[ValueRef]>>,
}

impl LightLambda {
    pub fn creator(&self) -> &Arc<DelegateCreator> {
        &self.creator
    }

    fn run_interpreted(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault> {
        let code = &self.creator.code;
        self.creator.stats.record_interpreted_call();
        let record = ctx.enter_interpreted(code)?;
        let mut frame = Frame::new(code, self.closure.clone(), record);
        frame.data[..args.len()].clone_from_slice(args);
        let result = VM::run(code, ctx, &mut frame);
        ctx.leave_frame();
        result?;
        Ok(if code.returns_value() { frame.pop() } else { Value::Null })
    }

    fn run_compiled(&self, ctx: &mut ExecutionContext, compiled: &Arc<dyn NativeLambda>, args: &[Value]) -> Result<Value, Fault> {
        self.creator.stats.record_compiled_call();
        compiled.call(ctx, self.closure.as_deref().unwrap_or(&[]), args)
    }
}

impl Function for LightLambda {
    fn name(&self) -> &str {
        self.creator.name()
    }

    fn arity(&self) -> usize {
        self.creator.code.arity()
    }

    fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.arity() {
            return Err(Fault::argument(format!(
                "{} expects {} arguments, got {}",
                self.name(),
                self.arity(),
                args.len()
            )));
        }

        // By-ref parameters take cells; plain values get a private one.
        let args: SmallVec<[Value; 4]> = self
            .creator
            .lambda
            .params
            .iter()
            .zip(args)
            .map(|(param, arg)| match arg {
                Value::Ref(_) => arg.clone(),
                _ if param.is_by_ref() => Value::Ref(ValueRef::new(arg.clone())),
                _ => arg.clone(),
            })
            .collect();

        if let Some(compiled) = self.creator.try_get_compiled() {
            return self.run_compiled(ctx, compiled, &args);
        }
        if self.creator.should_compile() {
            if let Some(compiled) = self.creator.trigger() {
                if compiled.signature() == &self.creator.signature {
                    return self.run_compiled(ctx, &compiled, &args);
                }
            }
        }
        self.run_interpreted(ctx, &args)
    }
}

static_assertions::assert_impl_all!(DelegateCreator: Send, Sync);
static_assertions::assert_impl_all!(LightLambda: Send, Sync);
