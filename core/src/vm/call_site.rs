//! Late-bound operations with a small polymorphic cache.

use super::context::ExecutionContext;
use super::fault::Fault;
use crate::values::{Callable, Value, ValueKind};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entries kept per site before the oldest is evicted.
const MAX_CACHE_ENTRIES: usize = 8;

/// Resolves a dynamic operation for concrete arguments.
pub trait CallSiteBinder: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the implementation for arguments shaped like `args`. The
    /// result is cached by argument kinds, so it must not depend on the
    /// argument values themselves.
    fn bind(&self, args: &[Value]) -> Result<Callable, Fault>;
}

type CacheKey = SmallVec<[ValueKind; 4]>;

pub struct CallSite {
    binder: Arc<dyn CallSiteBinder>,
    cache: RwLock<SmallVec<[(CacheKey, Callable); 2]>>,
    misses: AtomicUsize,
}

impl CallSite {
    pub fn new(binder: Arc<dyn CallSiteBinder>) -> Arc<Self> {
        Arc::new(Self { binder, cache: RwLock::new(SmallVec::new()), misses: AtomicUsize::new(0) })
    }

    pub fn name(&self) -> &str {
        self.binder.name()
    }

    /// Number of binder invocations so far.
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn invoke(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, Fault> {
        let target = self.resolve(args)?;
        target.call(ctx, args)
    }

    fn resolve(&self, args: &[Value]) -> Result<Callable, Fault> {
        let key: CacheKey = args.iter().map(Value::kind).collect();
        if let Some((_, target)) = self.cache.read().iter().find(|(k, _)| *k == key) {
            return Ok(Arc::clone(target));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let target = self.binder.bind(args)?;
        tracing::trace!(site = self.name(), ?key, "Call site bound");
        let mut cache = self.cache.write();
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.remove(0);
        }
        cache.push((key, Arc::clone(&target)));
        Ok(target)
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallSite({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::NativeFunction;

    struct AddBinder;

    impl CallSiteBinder for AddBinder {
        fn name(&self) -> &str {
            "add"
        }

        fn bind(&self, args: &[Value]) -> Result<Callable, Fault> {
            match (&args[0], &args[1]) {
                (Value::Int(_), Value::Int(_)) => Ok(NativeFunction::new("add_int", 2, |_, a| {
                    Ok(Value::Int(a[0].as_int().unwrap_or(0) + a[1].as_int().unwrap_or(0)))
                })),
                (Value::Str(_), Value::Str(_)) => Ok(NativeFunction::new("add_str", 2, |_, a| {
                    Ok(Value::str(&format!("{}{}", a[0].as_str().unwrap_or(""), a[1].as_str().unwrap_or(""))))
                })),
                (a, b) => Err(Fault::missing_member(format!("no add for {} and {}", a.type_name(), b.type_name()))),
            }
        }
    }

    #[test]
    fn test_cache_hits_by_argument_kind() {
        let site = CallSite::new(Arc::new(AddBinder));
        let mut ctx = ExecutionContext::new();
        for i in 0..3 {
            let result = site.invoke(&mut ctx, &[Value::Int(i), Value::Int(1)]);
            assert_eq!(result.ok(), Some(Value::Int(i + 1)));
        }
        assert_eq!(site.misses(), 1);
        let result = site.invoke(&mut ctx, &[Value::str("a"), Value::str("b")]);
        assert_eq!(result.ok(), Some(Value::str("ab")));
        assert_eq!(site.misses(), 2);
    }

    #[test]
    fn test_bind_failure_is_a_fault() {
        let site = CallSite::new(Arc::new(AddBinder));
        let mut ctx = ExecutionContext::new();
        let result = site.invoke(&mut ctx, &[Value::Int(1), Value::Null]);
        assert!(matches!(result, Err(Fault::Exception(e)) if e.class().name() == "MissingMemberException"));
    }
}
