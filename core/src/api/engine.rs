//! The compilation engine.

use super::{CompileOptionsOverride, CompiledExpression, EngineOptions, Error};
use crate::closure_compiler::ClosureCompiler;
use crate::compiler::BytecodeCompiler;
use crate::tiering::{DelegateCreator, NativeDelegate, TieringSettings, TieringSnapshot, TieringStats, TreeCompiler};
use crate::tree::LambdaExpr;
use std::sync::Arc;
use tracing::warn;

/// Compiles lambdas into runnable expressions.
///
/// The engine owns the native compiler used for promotion and the tiering
/// statistics shared by every expression it compiles.
///
/// # Example
///
/// ```
/// use arbor_core::api::{Engine, EngineOptions};
/// use arbor_core::tree::{Expr, LambdaExpr, Variable};
/// use arbor_core::types::Type;
/// use arbor_core::values::Value;
///
/// let engine = Engine::new(EngineOptions::default());
/// let x = Variable::new("x", Type::Int);
/// let lambda = LambdaExpr::new("double", vec![x.clone()], Expr::add(Expr::param(&x), Expr::param(&x)));
/// let expr = engine.compile(Default::default(), &lambda).unwrap();
/// assert_eq!(expr.run(Default::default(), &[Value::Int(21)]).unwrap(), Value::Int(42));
/// ```
pub struct Engine {
    options: EngineOptions,
    compiler: Arc<dyn TreeCompiler>,
    stats: Arc<TieringStats>,
}

impl Engine {
    /// An engine promoting hot code with the [`ClosureCompiler`].
    pub fn new(options: EngineOptions) -> Self {
        Self::with_compiler(options, Arc::new(ClosureCompiler::new()))
    }

    pub fn with_compiler(options: EngineOptions, compiler: Arc<dyn TreeCompiler>) -> Self {
        Self { options, compiler, stats: Arc::new(TieringStats::new()) }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Tiering counters of every expression compiled by this engine.
    pub fn stats(&self) -> TieringSnapshot {
        self.stats.snapshot()
    }

    /// Lowers `lambda` to instructions without falling back to the native
    /// tier.
    pub fn lower(
        &self,
        options_override: CompileOptionsOverride,
        lambda: &Arc<LambdaExpr>,
    ) -> Result<Arc<DelegateCreator>, Error> {
        let settings = self.settings(&options_override);
        Ok(BytecodeCompiler::lower_tree(lambda, &settings)?)
    }

    /// Compiles `lambda`. The result starts interpreted and is promoted once
    /// hot. Lambdas the lowering compiler rejects are compiled natively
    /// right away.
    pub fn compile(
        &self,
        options_override: CompileOptionsOverride,
        lambda: &Arc<LambdaExpr>,
    ) -> Result<CompiledExpression, Error> {
        let settings = self.settings(&options_override);
        let run_options = self.options.default_run_options.clone();
        match BytecodeCompiler::lower_tree(lambda, &settings) {
            Ok(creator) => Ok(CompiledExpression::interpreted(creator, run_options)),
            Err(error) => {
                warn!(lambda = %lambda.name, error = %error, "Lowering failed, compiling natively");
                let compiled = self.compiler.compile_lambda(lambda, &[])?;
                let function = Arc::new(NativeDelegate::new(&lambda.name, compiled, None));
                Ok(CompiledExpression::native(function, lambda.signature(), run_options))
            }
        }
    }

    fn settings(&self, options_override: &CompileOptionsOverride) -> TieringSettings {
        let mut options = self.options.default_compile_options.clone();
        options.override_with(options_override);
        TieringSettings {
            compilation_threshold: options.compilation_threshold,
            compile_synchronously: options.compile_synchronously,
            loop_tiering: options.loop_tiering,
            compiler: Arc::clone(&self.compiler),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

static_assertions::assert_impl_all!(Engine: Send, Sync);
