//! Public API.
//!
//! An [`Engine`] compiles lambdas into [`CompiledExpression`]s. Expressions
//! start on the interpreter and move to the native tier once they get hot;
//! callers see the same values and errors either way.
//!
//! # Example
//!
//! ```
//! use arbor_core::api::{CompileOptionsOverride, Engine, EngineOptions, RunOptionsOverride};
//! use arbor_core::tree::{Expr, LabelTarget, LambdaExpr, Variable};
//! use arbor_core::types::Type;
//! use arbor_core::values::Value;
//!
//! let engine = Engine::new(EngineOptions::default());
//!
//! // sign(x) = if x > 0 { return 1 } else { return -1 }
//! let x = Variable::new("x", Type::Int);
//! let ret = LabelTarget::typed("return", Type::Int);
//! let body = Expr::block(vec![], vec![
//!     Expr::if_then_else(
//!         Expr::greater_than(Expr::param(&x), Expr::int(0)),
//!         Expr::return_(&ret, Some(Expr::int(1))),
//!         Expr::return_(&ret, Some(Expr::int(-1))),
//!     ),
//!     Expr::label(&ret, Some(Expr::int(0))),
//! ]);
//! let sign = LambdaExpr::new("sign", vec![x], body);
//!
//! let options = CompileOptionsOverride { compilation_threshold: Some(2), ..Default::default() };
//! let expr = engine.compile(options, &sign).unwrap();
//! for _ in 0..5 {
//!     let result = expr.run(RunOptionsOverride::default(), &[Value::Int(5)]).unwrap();
//!     assert_eq!(result, Value::Int(1));
//! }
//! ```

pub mod engine;
pub mod error;
pub mod expression;
pub mod options;

pub use engine::Engine;
pub use error::Error;
pub use expression::CompiledExpression;
pub use options::{CompileOptions, CompileOptionsOverride, EngineOptions, RunOptions, RunOptionsOverride};
