//! Integration tests for the public API.
//!
//! These tests validate that the public API works end-to-end: lowering,
//! interpretation, promotion and error reporting.

mod common;

use arbor_core::api::{CompileOptionsOverride, Engine, EngineOptions, Error, RunOptionsOverride};
use arbor_core::tree::{CatchBlock, Expr, LambdaExpr, Variable};
use arbor_core::types::{Type, builtin};
use arbor_core::values::{ExceptionObject, Value};
use pretty_assertions::assert_eq;

#[test]
fn test_basic_compilation_and_execution() {
    let engine = Engine::new(EngineOptions::default());
    let x = Variable::new("x", Type::Int);
    let y = Variable::new("y", Type::Int);
    let lambda = LambdaExpr::new(
        "affine",
        vec![x.clone(), y.clone()],
        Expr::add(Expr::multiply(Expr::param(&x), Expr::param(&y)), Expr::int(1)),
    );

    let expr = engine.compile(CompileOptionsOverride::default(), &lambda).expect("compilation should succeed");
    let result = expr.run(Default::default(), &[Value::Int(6), Value::Int(7)]).expect("execution should succeed");

    assert_eq!(result, Value::Int(43));
    assert!(expr.creator().is_some(), "Plain trees start on the interpreter");
    assert!(!expr.is_compiled());
}

#[test]
fn test_lowering_failure_falls_back_to_native() {
    let engine = Engine::new(EngineOptions::default());
    let thrown = ExceptionObject::new(&builtin::ARGUMENT, "bad argument");
    let e = Variable::new("e", Type::exception());
    // Catch filters only exist in the native tier.
    let body = Expr::try_catch(
        Expr::throw(Expr::constant(Value::Exception(thrown), Type::exception())).typed(Type::Int),
        vec![
            CatchBlock::catch_all(Some(e.clone()), Expr::int(1)).with_filter(Expr::bool(false)),
            CatchBlock::catch_all(Some(e), Expr::int(2)),
        ],
    );
    let lambda = LambdaExpr::new("filtered", vec![], body);

    assert!(matches!(engine.lower(Default::default(), &lambda), Err(Error::Lowering(_))));

    let expr = engine.compile(Default::default(), &lambda).expect("native fallback");
    assert!(expr.creator().is_none());
    assert!(expr.is_compiled());
    assert_eq!(expr.run(Default::default(), &[]).unwrap(), Value::Int(2));
}

#[test]
fn test_runtime_error_carries_trace() {
    let engine = Engine::new(EngineOptions::default());
    let x = Variable::new("x", Type::Int);
    let lambda = LambdaExpr::new("div", vec![x.clone()], Expr::divide(Expr::int(10), Expr::param(&x)));
    let expr = engine.compile(common::interpreter_only(), &lambda).unwrap();

    match expr.run(Default::default(), &[Value::Int(0)]) {
        Err(Error::Runtime { fault, trace }) => {
            assert_eq!(fault.class().name(), "DivideByZeroException");
            assert_eq!(trace.len(), 1);
            assert_eq!(&*trace[0].function, "div");
            assert!(trace[0].instruction.is_some());
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn test_recursion_limit_is_a_resource_error() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::interpreter_only(), &common::recursive_depth()).unwrap();
    let shallow = RunOptionsOverride { max_depth: Some(16), ..Default::default() };

    assert_eq!(expr.run(shallow.clone(), &[Value::Int(5)]).unwrap(), Value::Int(5));
    assert!(matches!(expr.run(shallow, &[Value::Int(100)]), Err(Error::ResourceExceeded(_))));
    assert_eq!(expr.run(Default::default(), &[Value::Int(100)]).unwrap(), Value::Int(100));
}

#[test]
fn test_argument_validation() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(Default::default(), &common::sum_loop()).unwrap();

    assert!(matches!(expr.run(Default::default(), &[]), Err(Error::Api(_))));
    assert!(matches!(expr.run(Default::default(), &[Value::from(true)]), Err(Error::Api(_))));
    assert_eq!(expr.run(Default::default(), &[Value::Int(4)]).unwrap(), Value::Int(10));
}

#[test]
fn test_stats_count_interpreted_calls() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::interpreter_only(), &common::sum_loop()).unwrap();
    for _ in 0..3 {
        expr.run(Default::default(), &[Value::Int(3)]).unwrap();
    }
    let stats = engine.stats();
    assert_eq!(stats.interpreted_calls, 3);
    assert_eq!(stats.compiled_calls, 0);
    assert_eq!(stats.compilations_triggered, 0);
}
