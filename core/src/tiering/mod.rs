//! Adaptive tiering.
//!
//! Lowered lambdas start interpreted. Each [`DelegateCreator`] counts calls
//! and, past the compilation threshold, hands the lambda's tree to a
//! [`TreeCompiler`], inline or on the rayon pool. Later calls go to the
//! compiled callable. Hot loops inside an interpreted lambda are promoted
//! the same way through their [`LoopTier`], without waiting for the whole
//! lambda.

mod light_lambda;
mod loop_tier;
mod native;
mod stats;

pub use light_lambda::{DelegateCreator, LightLambda};
pub use loop_tier::LoopTier;
pub use native::{
    LocalBinding, LoopBindings, LoopExit, LoopFrame, NativeCompileError, NativeDelegate, NativeLambda, NativeLoop,
    TreeCompiler,
};
pub use stats::{TieringSnapshot, TieringStats};

use std::sync::Arc;

/// Promotion policy handed to the lowering compiler.
#[derive(Clone)]
pub struct TieringSettings {
    /// Interpreted calls before promotion; negative disables it.
    pub compilation_threshold: i32,
    pub compile_synchronously: bool,
    pub loop_tiering: bool,
    pub compiler: Arc<dyn TreeCompiler>,
    pub stats: Arc<TieringStats>,
}

impl TieringSettings {
    pub fn new(compiler: Arc<dyn TreeCompiler>) -> Self {
        Self {
            compilation_threshold: 32,
            compile_synchronously: false,
            loop_tiering: true,
            compiler,
            stats: Arc::new(TieringStats::new()),
        }
    }
}
