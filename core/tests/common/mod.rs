//! Trees shared by the integration tests.
#![allow(dead_code)]

use arbor_core::api::CompileOptionsOverride;
use arbor_core::tree::{Expr, LabelTarget, LambdaExpr, Variable};
use arbor_core::types::Type;
use std::sync::Arc;

/// Options that compile on the calling thread once `threshold` interpreted
/// calls have happened.
pub fn synchronous(threshold: i32) -> CompileOptionsOverride {
    CompileOptionsOverride {
        compilation_threshold: Some(threshold),
        compile_synchronously: Some(true),
        ..Default::default()
    }
}

pub fn interpreter_only() -> CompileOptionsOverride {
    CompileOptionsOverride { compilation_threshold: Some(-1), ..Default::default() }
}

/// `sum(n)`: 1 + 2 + ... + n with a loop.
pub fn sum_loop() -> Arc<LambdaExpr> {
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

/// `depth(x)`: a lambda that recurses `x` times through a captured variable.
pub fn recursive_depth() -> Arc<LambdaExpr> {
    let x = Variable::new("x", Type::Int);
    let n = Variable::new("n", Type::Int);
    let f = Variable::new("f", Type::function(vec![Type::Int], Type::Int));
    let count = LambdaExpr::new(
        "count",
        vec![n.clone()],
        Expr::condition(
            Expr::less_than_or_equal(Expr::param(&n), Expr::int(0)),
            Expr::int(0),
            Expr::add(
                Expr::int(1),
                Expr::invoke(Expr::param(&f), vec![Expr::subtract(Expr::param(&n), Expr::int(1))]),
            ),
        ),
    );
    let body = Expr::block(
        vec![f.clone()],
        vec![
            Expr::assign(Expr::param(&f), Expr::lambda(&count)),
            Expr::invoke(Expr::param(&f), vec![Expr::param(&x)]),
        ],
    );
    LambdaExpr::new("depth", vec![x], body)
}
