//! Callable values.
//!
//! Everything callable from a program implements [`Function`]: host
//! functions, interpreted lambdas and natively compiled lambdas alike.

use super::Value;
use crate::types::builtin;
use crate::vm::{ExecutionContext, Fault};
use std::fmt;
use std::sync::Arc;

pub type Callable = Arc<dyn Function>;

pub trait Function: Send + Sync {
    fn name(&self) -> &str {
        "<anonymous>"
    }

    fn arity(&self) -> usize;

    fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault>;
}

type NativeBody = dyn Fn(&mut ExecutionContext, &[Value]) -> Result<Value, Fault> + Send + Sync;

/// A host function.
pub struct NativeFunction {
    name: Arc<str>,
    arity: usize,
    body: Box<NativeBody>,
}

impl NativeFunction {
    pub fn new<F>(name: &str, arity: usize, body: F) -> Callable
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Arc::new(Self { name: name.into(), arity, body: Box::new(body) })
    }
}

impl Function for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> usize {
        self.arity
    }

    fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.arity {
            return Err(Fault::new(
                &builtin::ARGUMENT,
                format!("{} expects {} arguments, got {}", self.name, self.arity, args.len()),
            ));
        }
        (self.body)(ctx, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}/{}>", self.name, self.arity)
    }
}
