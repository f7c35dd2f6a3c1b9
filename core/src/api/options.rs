//! Engine, compilation and run options.
//!
//! Every options struct has an `*Override` twin whose `Option` fields are
//! applied on top of the defaults with `override_with`.

use crate::vm::{AbortHandle, DEFAULT_MAX_DEPTH};

/// Options fixed when an [`Engine`](super::Engine) is created.
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    pub default_compile_options: CompileOptions,
    pub default_run_options: RunOptions,
}

/// Tiering policy of one compiled expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Interpreted calls of a lambda before it is compiled natively.
    /// Negative disables promotion.
    pub compilation_threshold: i32,
    /// Compile on the calling thread instead of the rayon pool.
    pub compile_synchronously: bool,
    pub loop_tiering: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { compilation_threshold: 32, compile_synchronously: false, loop_tiering: true }
    }
}

impl CompileOptions {
    pub fn override_with(&mut self, overrides: &CompileOptionsOverride) {
        if let Some(threshold) = overrides.compilation_threshold {
            self.compilation_threshold = threshold;
        }
        if let Some(synchronous) = overrides.compile_synchronously {
            self.compile_synchronously = synchronous;
        }
        if let Some(loop_tiering) = overrides.loop_tiering {
            self.loop_tiering = loop_tiering;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptionsOverride {
    pub compilation_threshold: Option<i32>,
    pub compile_synchronously: Option<bool>,
    pub loop_tiering: Option<bool>,
}

/// Limits of one run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Maximum depth of the logical call stack.
    pub max_depth: usize,
    /// Lets the host abort the run from another thread.
    pub abort: Option<AbortHandle>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, abort: None }
    }
}

impl RunOptions {
    pub fn override_with(&mut self, overrides: &RunOptionsOverride) {
        if let Some(max_depth) = overrides.max_depth {
            self.max_depth = max_depth;
        }
        if let Some(abort) = &overrides.abort {
            self.abort = Some(abort.clone());
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunOptionsOverride {
    pub max_depth: Option<usize>,
    pub abort: Option<AbortHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_override_only_touches_given_fields() {
        let mut options = CompileOptions::default();
        options.override_with(&CompileOptionsOverride { compilation_threshold: Some(5), ..Default::default() });
        assert_eq!(
            options,
            CompileOptions { compilation_threshold: 5, compile_synchronously: false, loop_tiering: true }
        );

        let mut run = RunOptions::default();
        run.override_with(&RunOptionsOverride::default());
        assert_eq!(run.max_depth, 256);
        assert!(run.abort.is_none());
    }
}
