//! Exception handling on both tiers.
//!
//! Every tree runs once on the interpreter and once through the closure
//! compiler; both must agree.

mod common;

use arbor_core::api::{Engine, EngineOptions, Error, RunOptionsOverride};
use arbor_core::closure_compiler::ClosureCompiler;
use arbor_core::tiering::TreeCompiler;
use arbor_core::tree::{CatchBlock, Expr, LabelTarget, LambdaExpr, Variable};
use arbor_core::types::{ExceptionClass, Type, builtin};
use arbor_core::values::{ExceptionObject, Function, NativeFunction, Value};
use arbor_core::vm::{AbortHandle, ExecutionContext, Fault};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn interpreted(lambda: &Arc<LambdaExpr>, args: &[Value], abort: Option<AbortHandle>) -> Result<Value, Error> {
    let expr = Engine::new(EngineOptions::default()).compile(common::interpreter_only(), lambda)?;
    expr.run(RunOptionsOverride { abort, ..Default::default() }, args)
}

fn native(lambda: &Arc<LambdaExpr>, args: &[Value], abort: Option<AbortHandle>) -> Result<Value, Fault> {
    let compiled = ClosureCompiler::new().compile_lambda(lambda, &[]).expect("compiles natively");
    let mut ctx = ExecutionContext::new();
    if let Some(abort) = abort {
        ctx = ctx.with_abort_handle(abort);
    }
    compiled.call(&mut ctx, &[], args)
}

fn class(class: &Arc<ExceptionClass>) -> Type {
    Type::Exception(Arc::clone(class))
}

#[test]
fn test_narrowest_matching_handler_wins() {
    // try { try { 100 / x } catch (InvalidCast) { -1 } } catch (Arithmetic) { -2 } catch (Exception) { -3 }
    let x = Variable::new("x", Type::Int);
    let inner = Expr::try_catch(
        Expr::divide(Expr::int(100), Expr::param(&x)),
        vec![CatchBlock::new(class(&builtin::INVALID_CAST), None, Expr::int(-1))],
    );
    let body = Expr::try_catch(
        inner,
        vec![
            CatchBlock::new(class(&builtin::ARITHMETIC), None, Expr::int(-2)),
            CatchBlock::catch_all(None, Expr::int(-3)),
        ],
    );
    let lambda = LambdaExpr::new("handlers", vec![x], body);

    for (arg, expected) in [(5, 20), (0, -2)] {
        assert_eq!(interpreted(&lambda, &[Value::Int(arg)], None).unwrap(), Value::Int(expected));
        assert_eq!(native(&lambda, &[Value::Int(arg)], None).unwrap(), Value::Int(expected));
    }
}

#[test]
fn test_finally_runs_on_fault_exit() {
    // block [log] { try { try { throw } finally { log = log + 10 } } catch { log = log + 1 }; log }
    let log = Variable::new("log", Type::Int);
    let bump = |by| Expr::assign(Expr::param(&log), Expr::add(Expr::param(&log), Expr::int(by)));
    let body = Expr::block(
        vec![log.clone()],
        vec![
            Expr::try_catch(
                Expr::try_finally(Expr::throw(Expr::constant(Value::str("oops"), Type::Str)), bump(10)),
                vec![CatchBlock::catch_all(None, bump(1))],
            ),
            Expr::param(&log),
        ],
    );
    let lambda = LambdaExpr::new("finally", vec![], body);

    // Throwing a string is itself an invalid cast, which the catch-all sees.
    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Int(11));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Int(11));
}

#[test]
fn test_finally_runs_on_jump_exit() {
    let count = Variable::new("count", Type::Int);
    let out = LabelTarget::new("out");
    let body = Expr::block(
        vec![count.clone()],
        vec![
            Expr::try_finally(
                Expr::void_block(vec![], vec![Expr::goto(&out), Expr::assign(Expr::param(&count), Expr::int(100))]),
                Expr::assign(Expr::param(&count), Expr::add(Expr::param(&count), Expr::int(1))),
            ),
            Expr::label(&out, None),
            Expr::param(&count),
        ],
    );
    let lambda = LambdaExpr::new("jump", vec![], body);
    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Int(1));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Int(1));
}

#[test]
fn test_fault_block_sees_fault_and_rethrows() {
    let seen = Variable::new("seen", Type::Int);
    let body = Expr::block(
        vec![seen.clone()],
        vec![
            Expr::try_catch(
                Expr::try_fault(
                    Expr::divide(Expr::int(1), Expr::int(0)),
                    Expr::assign(Expr::param(&seen), Expr::int(7)),
                ),
                vec![CatchBlock::catch_all(None, Expr::int(0))],
            ),
            Expr::param(&seen),
        ],
    );
    let lambda = LambdaExpr::new("fault", vec![], body);
    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Int(7));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Int(7));
}

#[test]
fn test_rethrow_keeps_identity_natively() {
    let thrown = ExceptionObject::new(&builtin::ARGUMENT, "same");
    let e = Variable::new("e", Type::exception());
    let lambda = LambdaExpr::new(
        "rethrow",
        vec![],
        Expr::try_catch(
            Expr::throw(Expr::constant(Value::Exception(Arc::clone(&thrown)), Type::exception())),
            vec![CatchBlock::catch_all(Some(e), Expr::rethrow())],
        ),
    );

    let fault = native(&lambda, &[], None).unwrap_err();
    assert!(Arc::ptr_eq(fault.exception(), &thrown));
    match interpreted(&lambda, &[], None) {
        Err(Error::Runtime { fault, .. }) => assert!(Arc::ptr_eq(fault.exception(), &thrown)),
        other => panic!("expected the rethrown exception, got {:?}", other),
    }
}

/// `block [n] { try { loop { n = n + 1 } } catch { on_catch(); n = -1 }; n }`
fn spinning_catch(on_catch: Value) -> Arc<LambdaExpr> {
    let n = Variable::new("n", Type::Int);
    let spin = Expr::loop_(
        Expr::assign(Expr::param(&n), Expr::add(Expr::param(&n), Expr::int(1))),
        None,
        None,
    );
    let handler = Expr::void_block(
        vec![],
        vec![
            Expr::invoke(Expr::constant(on_catch, Type::function(vec![], Type::Void)), vec![]),
            Expr::assign(Expr::param(&n), Expr::int(-1)),
        ],
    );
    let body = Expr::block(
        vec![n.clone()],
        vec![Expr::try_catch(spin, vec![CatchBlock::catch_all(None, handler)]), Expr::param(&n)],
    );
    LambdaExpr::new("spin", vec![], body)
}

#[test]
fn test_abort_is_reraised_after_catch() {
    let nothing = NativeFunction::new("nothing", 0, |_, _| Ok(Value::Null));
    let lambda = spinning_catch(Value::Function(nothing));

    let abort = AbortHandle::new();
    abort.request(Value::str("stop"));
    match interpreted(&lambda, &[], Some(abort.clone())) {
        Err(Error::Runtime { fault, .. }) => assert!(fault.is_abort()),
        other => panic!("expected an abort, got {:?}", other),
    }
    assert!(native(&lambda, &[], Some(abort)).is_err_and(|fault| fault.is_abort()));
}

#[test]
fn test_reset_inside_handler_cancels_abort() {
    for tier in ["interpreted", "native"] {
        let abort = AbortHandle::new();
        abort.request(Value::Null);
        let handle = abort.clone();
        let reset = NativeFunction::new("reset", 0, move |_, _| {
            handle.reset();
            Ok(Value::Null)
        });
        let lambda = spinning_catch(Value::Function(reset));

        let result = match tier {
            "interpreted" => interpreted(&lambda, &[], Some(abort)).ok(),
            _ => native(&lambda, &[], Some(abort)).ok(),
        };
        assert_eq!(result, Some(Value::Int(-1)), "{} tier", tier);
    }
}

#[test]
fn test_trace_has_one_entry_per_interpreted_call() {
    let x = Variable::new("x", Type::Int);
    let n = Variable::new("n", Type::Int);
    let helper = Variable::new("helper", Type::function(vec![Type::Int], Type::Int));
    let divide = LambdaExpr::new("helper", vec![n.clone()], Expr::divide(Expr::int(10), Expr::param(&n)));
    let body = Expr::block(
        vec![helper.clone()],
        vec![
            Expr::assign(Expr::param(&helper), Expr::lambda(&divide)),
            Expr::invoke(Expr::param(&helper), vec![Expr::param(&x)]),
        ],
    );
    let lambda = LambdaExpr::new("main", vec![x], body);

    match interpreted(&lambda, &[Value::Int(0)], None) {
        Err(Error::Runtime { trace, .. }) => {
            let names: Vec<&str> = trace.iter().map(|entry| &*entry.function).collect();
            assert_eq!(names, vec!["helper", "main"]);
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn test_native_function_faults_are_catchable() {
    let fail = NativeFunction::new("fail", 0, |_, _| Err(Fault::argument("nope")));
    let e = Variable::new("e", Type::exception());
    let body = Expr::try_catch(
        Expr::invoke(Expr::constant(Value::Function(Arc::clone(&fail)), Type::function(vec![], Type::Int)), vec![]),
        vec![CatchBlock::new(class(&builtin::ARGUMENT), Some(e), Expr::int(-1))],
    );
    let lambda = LambdaExpr::new("host", vec![], body);
    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Int(-1));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Int(-1));
    assert_eq!(fail.arity(), 0);
}

#[test]
fn test_lambda_in_handler_captures_caught_exception() {
    // try { throw ArgumentException; 0 } catch (Exception e) { (() => e)(); 1 }
    let e = Variable::new("e", Type::exception());
    let read = LambdaExpr::new("read", vec![], Expr::param(&e));
    let thrown = ExceptionObject::new(&builtin::ARGUMENT, "captured");
    let body = Expr::try_catch(
        Expr::block(
            vec![],
            vec![Expr::throw(Expr::constant(Value::Exception(thrown), Type::exception())), Expr::int(0)],
        ),
        vec![CatchBlock::catch_all(
            Some(e),
            Expr::block(vec![], vec![Expr::invoke(Expr::lambda(&read), vec![]), Expr::int(1)]),
        )],
    );
    let lambda = LambdaExpr::new("capture", vec![], body);

    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Int(1));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Int(1));
}

#[test]
fn test_lambda_in_handler_replaces_caught_exception() {
    // try {
    //     try { throw ArgumentException } catch (Exception e) { (() => { e = InvalidCastException })(); rethrow }
    // } catch (Exception outer) { outer is InvalidCastException }
    let e = Variable::new("e", Type::exception());
    let outer = Variable::new("outer", Type::exception());
    let replacement = ExceptionObject::new(&builtin::INVALID_CAST, "replacement");
    let replace = LambdaExpr::new(
        "replace",
        vec![],
        Expr::assign(Expr::param(&e), Expr::constant(Value::Exception(replacement), Type::exception())),
    );
    let thrown = ExceptionObject::new(&builtin::ARGUMENT, "original");
    let inner = Expr::try_catch(
        Expr::throw(Expr::constant(Value::Exception(thrown), Type::exception())),
        vec![CatchBlock::catch_all(
            Some(e),
            Expr::void_block(vec![], vec![Expr::invoke(Expr::lambda(&replace), vec![]), Expr::rethrow()]),
        )],
    );
    let body = Expr::block(
        vec![outer.clone()],
        vec![
            Expr::try_catch(inner, vec![CatchBlock::catch_all(Some(outer.clone()), Expr::empty())]),
            Expr::type_is(Expr::param(&outer), class(&builtin::INVALID_CAST)),
        ],
    );
    let lambda = LambdaExpr::new("replace_caught", vec![], body);

    assert_eq!(interpreted(&lambda, &[], None).unwrap(), Value::Bool(true));
    assert_eq!(native(&lambda, &[], None).unwrap(), Value::Bool(true));
}
