//! Expressions shared between threads while background promotion runs.

mod common;

use arbor_core::api::{CompileOptionsOverride, Engine, EngineOptions};
use arbor_core::values::Value;
use pretty_assertions::assert_eq;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_parallel_runs_trigger_one_compilation() {
    let engine = Engine::new(EngineOptions::default());
    let options = CompileOptionsOverride {
        compilation_threshold: Some(10),
        compile_synchronously: Some(false),
        loop_tiering: Some(false),
    };
    let expr = engine.compile(options, &common::sum_loop()).unwrap();

    thread::scope(|scope| {
        for worker in 0..8 {
            let expr = &expr;
            scope.spawn(move || {
                for i in 0..50 {
                    let n = worker * 50 + i;
                    let result = expr.run(Default::default(), &[Value::Int(n)]).unwrap();
                    assert_eq!(result, Value::Int(n * (n + 1) / 2));
                }
            });
        }
    });

    // Compilation runs on the rayon pool; give it time to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !expr.is_compiled() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(expr.is_compiled());

    let stats = engine.stats();
    assert_eq!(stats.compilations_triggered, 1);
    assert_eq!(stats.compilations_completed, 1);
    assert_eq!(stats.interpreted_calls + stats.compiled_calls, 400);

    assert_eq!(expr.run(Default::default(), &[Value::Int(1000)]).unwrap(), Value::Int(500_500));
}

#[test]
fn test_abort_from_another_thread() {
    use arbor_core::api::{Error, RunOptionsOverride};
    use arbor_core::tree::{Expr, LambdaExpr};
    use arbor_core::vm::AbortHandle;

    let engine = Engine::new(EngineOptions::default());
    let spin = LambdaExpr::new("spin", vec![], Expr::loop_(Expr::empty(), None, None));
    let expr = engine.compile(common::synchronous(0), &spin).unwrap();

    let abort = AbortHandle::new();
    let result = thread::scope(|scope| {
        let handle = abort.clone();
        let runner = scope.spawn(|| expr.run(RunOptionsOverride { abort: Some(handle), ..Default::default() }, &[]));
        thread::sleep(Duration::from_millis(20));
        abort.request(Value::str("shutdown"));
        runner.join()
    });

    match result {
        Ok(Err(Error::Runtime { fault, .. })) => {
            assert!(fault.is_abort());
            assert_eq!(fault.exception().message(), "shutdown");
        }
        Ok(other) => panic!("expected an abort, got {:?}", other),
        Err(_) => panic!("runner thread panicked"),
    }
}
