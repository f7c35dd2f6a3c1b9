use super::native::{LoopBindings, NativeLoop};
use super::{TieringSettings, TieringStats, TreeCompiler};
use crate::tree::LoopExpr;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Promotion state of one loop of a lowered lambda. Counts entries of the
/// loop header, iterations included.
pub struct LoopTier {
    name: Arc<str>,
    loop_expr: Arc<LoopExpr>,
    bindings: LoopBindings,
    compiler: Arc<dyn TreeCompiler>,
    synchronous: bool,
    remaining: AtomicI32,
    /// `None` records a failed compilation.
    compiled: OnceLock<Option<Arc<dyn NativeLoop>>>,
    compile_lock: Mutex<()>,
    stats: Arc<TieringStats>,
}

impl LoopTier {
    pub(crate) fn new(
        lambda_name: &Arc<str>,
        loop_expr: Arc<LoopExpr>,
        bindings: LoopBindings,
        settings: &TieringSettings,
    ) -> Self {
        Self {
            name: Arc::clone(lambda_name),
            loop_expr,
            bindings,
            compiler: Arc::clone(&settings.compiler),
            synchronous: settings.compile_synchronously,
            remaining: AtomicI32::new(settings.compilation_threshold),
            compiled: OnceLock::new(),
            compile_lock: Mutex::new(()),
            stats: Arc::clone(&settings.stats),
        }
    }

    pub fn bindings(&self) -> &LoopBindings {
        &self.bindings
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.compiled.get(), Some(Some(_)))
    }

    /// Called by the interpreter on every pass through the loop header.
    /// Returns the compiled loop once it is ready.
    pub fn enter(self: &Arc<Self>) -> Option<Arc<dyn NativeLoop>> {
        if let Some(compiled) = self.compiled.get() {
            return compiled.clone();
        }
        if self.remaining.load(Ordering::Relaxed) < 0 || self.remaining.fetch_sub(1, Ordering::Relaxed) != 0 {
            return None;
        }
        if self.synchronous {
            return self.compile();
        }
        debug!(lambda = %self.name, "Scheduling background loop compilation");
        let tier = Arc::clone(self);
        rayon::spawn(move || {
            let _ = tier.compile();
        });
        None
    }

    fn compile(&self) -> Option<Arc<dyn NativeLoop>> {
        if let Some(compiled) = self.compiled.get() {
            return compiled.clone();
        }
        let _guard = self.compile_lock.lock();
        if let Some(compiled) = self.compiled.get() {
            return compiled.clone();
        }

        let compiled = match self.compiler.compile_loop(&self.loop_expr, &self.bindings) {
            Ok(compiled) => {
                self.stats.record_loop_compilation();
                info!(lambda = %self.name, "Loop promoted to the compiled tier");
                Some(compiled)
            }
            Err(e) => {
                warn!(lambda = %self.name, error = %e, "Loop compilation failed, staying interpreted");
                None
            }
        };
        let _ = self.compiled.set(compiled.clone());
        compiled
    }
}

static_assertions::assert_impl_all!(LoopTier: Send, Sync);
