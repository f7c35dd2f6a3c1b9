//! Promotion of lambdas and loops.

mod common;

use arbor_core::api::{CompileOptionsOverride, Engine, EngineOptions};
use arbor_core::tiering::TieringSnapshot;
use arbor_core::tree::{Expr, LambdaExpr, Variable};
use arbor_core::types::Type;
use arbor_core::values::Value;
use pretty_assertions::assert_eq;

#[test]
fn test_lambda_promotes_after_threshold() {
    let engine = Engine::new(EngineOptions::default());
    let x = Variable::new("x", Type::Int);
    let lambda = LambdaExpr::new("square", vec![x.clone()], Expr::multiply(Expr::param(&x), Expr::param(&x)));
    let expr = engine.compile(common::synchronous(5), &lambda).unwrap();

    let results: Vec<Value> = (0..7).map(|i| expr.run(Default::default(), &[Value::Int(i)]).unwrap()).collect();
    let expected: Vec<Value> = (0..7).map(|i| Value::Int(i * i)).collect();
    assert_eq!(results, expected);

    assert_eq!(
        engine.stats(),
        TieringSnapshot {
            interpreted_calls: 5,
            compiled_calls: 2,
            compilations_triggered: 1,
            compilations_completed: 1,
            ..Default::default()
        }
    );
    assert!(expr.is_compiled());
}

#[test]
fn test_hot_loop_hands_off_mid_call() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::synchronous(3), &common::sum_loop()).unwrap();

    assert_eq!(expr.run(Default::default(), &[Value::Int(100)]).unwrap(), Value::Int(5050));

    let stats = engine.stats();
    assert_eq!(stats.loop_compilations, 1);
    assert_eq!(stats.interpreted_calls, 1);
    assert_eq!(stats.compilations_triggered, 0);
    assert!(!expr.is_compiled());
}

#[test]
fn test_loop_tiering_can_be_disabled() {
    let engine = Engine::new(EngineOptions::default());
    let options = CompileOptionsOverride { loop_tiering: Some(false), ..common::synchronous(3) };
    let expr = engine.compile(options, &common::sum_loop()).unwrap();

    assert_eq!(expr.run(Default::default(), &[Value::Int(100)]).unwrap(), Value::Int(5050));
    assert_eq!(engine.stats().loop_compilations, 0);
}

#[test]
fn test_results_identical_across_tiers() {
    let engine = Engine::new(EngineOptions::default());
    let lambda = common::sum_loop();
    let interpreted = engine.compile(common::interpreter_only(), &lambda).unwrap();
    let promoted = engine.compile(common::synchronous(1), &lambda).unwrap();

    for n in [0, 1, 2, 10, 37] {
        let expected = interpreted.run(Default::default(), &[Value::Int(n)]).unwrap();
        assert_eq!(expected, Value::Int(n * (n + 1) / 2));
        assert_eq!(promoted.run(Default::default(), &[Value::Int(n)]).unwrap(), expected, "n = {}", n);
    }
    assert!(promoted.is_compiled());
}

#[test]
fn test_negative_threshold_never_compiles() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::interpreter_only(), &common::sum_loop()).unwrap();
    for _ in 0..100 {
        expr.run(Default::default(), &[Value::Int(50)]).unwrap();
    }
    let stats = engine.stats();
    assert_eq!(stats.compilations_triggered, 0);
    assert_eq!(stats.loop_compilations, 0);
    assert_eq!(stats.interpreted_calls, 100);
}
