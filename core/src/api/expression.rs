//! Compiled expressions.

use super::{Error, RunOptions, RunOptionsOverride};
use crate::tiering::DelegateCreator;
use crate::types::{Signature, Type};
use crate::values::{Callable, Value};
use crate::vm::ExecutionContext;
use std::sync::Arc;

/// A compiled lambda ready to run.
///
/// Expressions are `Send + Sync` and can run on many threads at once; each
/// run gets its own [`ExecutionContext`].
pub struct CompiledExpression {
    function: Callable,
    signature: Signature,
    /// Set when the expression was lowered and starts interpreted.
    creator: Option<Arc<DelegateCreator>>,
    default_run_options: RunOptions,
}

impl CompiledExpression {
    pub(crate) fn interpreted(creator: Arc<DelegateCreator>, default_run_options: RunOptions) -> Self {
        Self {
            function: creator.create_delegate(None),
            signature: creator.lambda().signature(),
            creator: Some(creator),
            default_run_options,
        }
    }

    pub(crate) fn native(function: Callable, signature: Signature, default_run_options: RunOptions) -> Self {
        Self { function, signature, creator: None, default_run_options }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The expression as a function value.
    pub fn function(&self) -> &Callable {
        &self.function
    }

    /// The lowered form, unless lowering failed and the expression went
    /// straight to the native tier.
    pub fn creator(&self) -> Option<&Arc<DelegateCreator>> {
        self.creator.as_ref()
    }

    /// True once calls no longer go through the interpreter.
    pub fn is_compiled(&self) -> bool {
        self.creator.as_ref().is_none_or(|creator| creator.is_compiled())
    }

    /// Runs the expression after checking the arguments against its
    /// signature.
    pub fn run(&self, options_override: RunOptionsOverride, args: &[Value]) -> Result<Value, Error> {
        self.validate(args)?;
        let mut options = self.default_run_options.clone();
        options.override_with(&options_override);

        let mut ctx = ExecutionContext::new().with_max_depth(options.max_depth);
        if let Some(abort) = options.abort {
            ctx = ctx.with_abort_handle(abort);
        }
        self.run_with(&mut ctx, args)
    }

    /// Runs the expression on a caller-provided context, without argument
    /// checks.
    pub fn run_with(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Error> {
        let result = self.function.call(ctx, args);
        ctx.finish_abort();
        Ok(result?)
    }

    fn validate(&self, args: &[Value]) -> Result<(), Error> {
        let params = &self.signature.params;
        if args.len() != params.len() {
            return Err(Error::Api(format!("expected {} arguments, got {}", params.len(), args.len())));
        }
        for (i, (ty, arg)) in params.iter().zip(args).enumerate() {
            let accepted = match ty {
                Type::Ref(_) => true,
                ty => arg.is_null() || ty.accepts(arg),
            };
            if !accepted {
                return Err(Error::Api(format!("argument {} is {}, expected {}", i, arg.type_name(), ty)));
            }
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(CompiledExpression: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CompileOptionsOverride, Engine};
    use crate::tree::{Expr, LambdaExpr, Variable};

    #[test]
    fn test_argument_checks() {
        let x = Variable::new("x", Type::Int);
        let lambda = LambdaExpr::new("id", vec![x.clone()], Expr::param(&x));
        let expr = Engine::default().compile(CompileOptionsOverride::default(), &lambda).expect("compiles");

        assert!(matches!(expr.run(Default::default(), &[]), Err(Error::Api(_))));
        assert!(matches!(expr.run(Default::default(), &[Value::str("no")]), Err(Error::Api(_))));
        assert_eq!(expr.run(Default::default(), &[Value::Int(3)]).ok(), Some(Value::Int(3)));
    }
}
