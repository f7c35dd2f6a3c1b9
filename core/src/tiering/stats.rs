use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every delegate creator and loop tier of an engine.
#[derive(Debug, Default)]
pub struct TieringStats {
    interpreted_calls: AtomicU64,
    compiled_calls: AtomicU64,
    compilations_triggered: AtomicU64,
    compilations_completed: AtomicU64,
    compilations_failed: AtomicU64,
    loop_compilations: AtomicU64,
}

/// Point-in-time copy of [`TieringStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TieringSnapshot {
    pub interpreted_calls: u64,
    pub compiled_calls: u64,
    pub compilations_triggered: u64,
    pub compilations_completed: u64,
    pub compilations_failed: u64,
    pub loop_compilations: u64,
}

impl TieringStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_interpreted_call(&self) {
        self.interpreted_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compiled_call(&self) {
        self.compiled_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trigger(&self) {
        self.compilations_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.compilations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.compilations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loop_compilation(&self) {
        self.loop_compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TieringSnapshot {
        TieringSnapshot {
            interpreted_calls: self.interpreted_calls.load(Ordering::Relaxed),
            compiled_calls: self.compiled_calls.load(Ordering::Relaxed),
            compilations_triggered: self.compilations_triggered.load(Ordering::Relaxed),
            compilations_completed: self.compilations_completed.load(Ordering::Relaxed),
            compilations_failed: self.compilations_failed.load(Ordering::Relaxed),
            loop_compilations: self.loop_compilations.load(Ordering::Relaxed),
        }
    }
}
