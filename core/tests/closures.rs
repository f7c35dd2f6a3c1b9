//! Closures sharing cells across the interpreter and the compiled tier.

mod common;

use arbor_core::api::{Engine, EngineOptions};
use arbor_core::tree::{Expr, LambdaExpr, Variable};
use arbor_core::types::Type;
use arbor_core::values::{Function, Value};
use arbor_core::vm::ExecutionContext;
use pretty_assertions::assert_eq;
use std::sync::Arc;

/// `count() { block [count, next] { next = () => { count = count + 1; count }; next(); next(); next() } }`
fn counter_calls() -> Arc<LambdaExpr> {
    let count = Variable::new("count", Type::Int);
    let next = Variable::new("next", Type::function(vec![], Type::Int));
    let increment = LambdaExpr::new(
        "increment",
        vec![],
        Expr::block(
            vec![],
            vec![
                Expr::assign(Expr::param(&count), Expr::add(Expr::param(&count), Expr::int(1))),
                Expr::param(&count),
            ],
        ),
    );
    let call_next = || Expr::invoke(Expr::param(&next), vec![]);
    LambdaExpr::new(
        "count",
        vec![],
        Expr::block(
            vec![count.clone(), next.clone()],
            vec![Expr::assign(Expr::param(&next), Expr::lambda(&increment)), call_next(), call_next(), call_next()],
        ),
    )
}

/// `make(start) { block [n] { n = start; () => { n = n + 1; n } } }`
fn counter_factory() -> Arc<LambdaExpr> {
    let start = Variable::new("start", Type::Int);
    let n = Variable::new("n", Type::Int);
    let increment = LambdaExpr::new(
        "increment",
        vec![],
        Expr::block(
            vec![],
            vec![Expr::assign(Expr::param(&n), Expr::add(Expr::param(&n), Expr::int(1))), Expr::param(&n)],
        ),
    );
    LambdaExpr::new(
        "make",
        vec![start.clone()],
        Expr::block(
            vec![n.clone()],
            vec![Expr::assign(Expr::param(&n), Expr::param(&start)), Expr::lambda(&increment)],
        ),
    )
}

#[test]
fn test_captured_counter_survives_promotion() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::synchronous(2), &counter_calls()).unwrap();

    // The inner lambda is promoted during the first run and the outer one
    // on the third; every run must still count to three.
    for run in 0..5 {
        assert_eq!(expr.run(Default::default(), &[]).unwrap(), Value::Int(3), "run {}", run);
    }
    let stats = engine.stats();
    assert!(stats.compilations_completed >= 2, "{:?}", stats);
    assert!(expr.is_compiled());
}

#[test]
fn test_returned_closures_keep_private_cells() {
    let engine = Engine::new(EngineOptions::default());
    let expr = engine.compile(common::synchronous(1), &counter_factory()).unwrap();

    let first = expr.run(Default::default(), &[Value::Int(10)]).unwrap();
    let second = expr.run(Default::default(), &[Value::Int(100)]).unwrap();
    let (Some(first), Some(second)) = (first.as_function(), second.as_function()) else {
        panic!("factory should return functions");
    };

    let mut ctx = ExecutionContext::new();
    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(first.call(&mut ctx, &[]).unwrap());
        results.push(second.call(&mut ctx, &[]).unwrap());
    }
    let expected: Vec<Value> = [11, 101, 12, 102, 13, 103].into_iter().map(Value::Int).collect();
    assert_eq!(results, expected);
}

#[test]
fn test_closures_agree_on_both_tiers() {
    let engine = Engine::new(EngineOptions::default());
    let interpreted = engine.compile(common::interpreter_only(), &counter_calls()).unwrap();
    let eager = engine.compile(common::synchronous(0), &counter_calls()).unwrap();

    assert_eq!(interpreted.run(Default::default(), &[]).unwrap(), Value::Int(3));
    assert_eq!(eager.run(Default::default(), &[]).unwrap(), Value::Int(3));
    assert!(!interpreted.is_compiled());
    assert!(eager.is_compiled());
}
