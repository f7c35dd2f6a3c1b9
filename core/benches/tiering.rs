//! Benchmarks for the interpreter vs the compiled tier
//!
//! Run with: `cargo bench --bench tiering`

use arbor_core::api::{CompileOptionsOverride, CompiledExpression, Engine, EngineOptions};
use arbor_core::tree::{Expr, LabelTarget, LambdaExpr, Variable};
use arbor_core::types::Type;
use arbor_core::values::Value;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

/// `sum(n)`: 1 + 2 + ... + n with a loop.
fn sum_loop() -> Arc<LambdaExpr> {
    let n = Variable::new("n", Type::Int);
    let i = Variable::new("i", Type::Int);
    let total = Variable::new("total", Type::Int);
    let done = LabelTarget::typed("done", Type::Int);
    let body = Expr::block(
        vec![i.clone(), total.clone()],
        vec![Expr::loop_(
            Expr::if_then_else(
                Expr::less_than(Expr::param(&i), Expr::param(&n)),
                Expr::void_block(
                    vec![],
                    vec![
                        Expr::assign(Expr::param(&i), Expr::add(Expr::param(&i), Expr::int(1))),
                        Expr::assign(Expr::param(&total), Expr::add(Expr::param(&total), Expr::param(&i))),
                    ],
                ),
                Expr::break_(&done, Some(Expr::param(&total))),
            ),
            Some(done),
            None,
        )],
    );
    LambdaExpr::new("sum", vec![n], body)
}

fn compile(engine: &Engine, threshold: i32, loop_tiering: bool) -> CompiledExpression {
    let options = CompileOptionsOverride {
        compilation_threshold: Some(threshold),
        compile_synchronously: Some(true),
        loop_tiering: Some(loop_tiering),
    };
    engine.compile(options, &sum_loop()).unwrap()
}

fn bench_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_loop");
    let engine = Engine::new(EngineOptions::default());

    let tiers = [
        ("interpreted", compile(&engine, -1, false)),
        ("compiled", compile(&engine, 0, false)),
        ("loop_tiered", compile(&engine, 8, true)),
    ];

    for n in [10i64, 1_000, 100_000] {
        for (name, expr) in &tiers {
            group.bench_with_input(BenchmarkId::new(*name, n), &n, |b, &n| {
                b.iter(|| expr.run(Default::default(), &[Value::Int(black_box(n))]).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_lowering(c: &mut Criterion) {
    let engine = Engine::new(EngineOptions::default());
    let lambda = sum_loop();
    c.bench_function("lower_sum_loop", |b| {
        b.iter(|| engine.lower(Default::default(), black_box(&lambda)).unwrap());
    });
}

criterion_group!(benches, bench_sum, bench_lowering);
criterion_main!(benches);
