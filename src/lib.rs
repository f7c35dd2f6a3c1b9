//! Arbor - an adaptive expression-tree interpreter
//!
//! # Overview
//!
//! Arbor runs lambdas given as expression trees. A tree is lowered to a
//! compact instruction stream and interpreted right away, so short-lived
//! code never pays for full compilation. Lambdas and loops that turn out to
//! be hot are promoted to a compiled tier in the background; callers see
//! the same values and exceptions from either tier.
//!
//! # Quick Start
//!
//! ```
//! use arbor::{Engine, EngineOptions, CompileOptionsOverride};
//! use arbor::tree::{Expr, LambdaExpr, Variable};
//! use arbor::types::Type;
//! use arbor::values::Value;
//!
//! let engine = Engine::new(EngineOptions::default());
//!
//! let x = Variable::new("x", Type::Int);
//! let lambda = LambdaExpr::new("inc", vec![x.clone()], Expr::add(Expr::param(&x), Expr::int(1)));
//!
//! let expr = engine.compile(CompileOptionsOverride::default(), &lambda).unwrap();
//! let result = expr.run(Default::default(), &[Value::Int(41)]).unwrap();
//! assert_eq!(result, Value::Int(42));
//! ```
//!
//! # Host Functions
//!
//! Host code is called through [`NativeFunction`] values embedded in the
//! tree:
//!
//! ```
//! use arbor::{Engine, NativeFunction, Value};
//! use arbor::tree::{Expr, LambdaExpr};
//! use arbor::types::Type;
//!
//! let answer = NativeFunction::new("answer", 0, |_ctx, _args| Ok(Value::Int(42)));
//! let call = Expr::invoke(Expr::constant(Value::Function(answer), Type::function(vec![], Type::Int)), vec![]);
//! let lambda = LambdaExpr::new("main", vec![], call);
//!
//! let expr = Engine::default().compile(Default::default(), &lambda).unwrap();
//! assert_eq!(expr.run(Default::default(), &[]).unwrap(), Value::Int(42));
//! ```

pub mod trace_renderer;
pub use trace_renderer::{CharSet, RenderConfig, render_error, render_error_to, render_error_to_string};

// Re-export public API from arbor_core
pub use arbor_core::api::{
    CompileOptions, CompileOptionsOverride, CompiledExpression, Engine, EngineOptions, Error, RunOptions,
    RunOptionsOverride,
};

pub use arbor_core::closure_compiler::ClosureCompiler;
pub use arbor_core::tiering::{TieringSnapshot, TreeCompiler};
pub use arbor_core::tree;
pub use arbor_core::types::{self, Type};
pub use arbor_core::values::{self, Function, NativeFunction, Value};
pub use arbor_core::vm::{AbortHandle, ExecutionContext, Fault};
