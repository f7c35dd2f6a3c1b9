//! Adaptive tree interpreter.
//!
//! Lambdas built with [`tree`] are lowered by [`compiler`] into an
//! instruction stream that the [`vm`] interprets. The [`tiering`] layer
//! counts calls and loop iterations and promotes hot code to a native tier,
//! by default the [`closure_compiler`]. The [`api`] module wraps all of it.

pub mod api;
pub mod closure_compiler;
pub mod compiler;
pub mod tiering;
pub mod tree;
pub mod types;
pub mod values;
pub mod vm;

pub use api::{CompiledExpression, Engine, EngineOptions, Error};
