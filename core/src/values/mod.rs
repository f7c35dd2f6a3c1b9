//! Runtime values.
//!
//! Values are reference counted and `Send + Sync` so that one compiled
//! program can run on many threads at once. Mutable aggregates (arrays,
//! object fields, reference cells) use `parking_lot` locks.

mod exception;
mod function;
mod object;

pub use exception::{ExceptionObject, ExceptionRef, TraceEntry};
pub use function::{Callable, Function, NativeFunction};
pub use object::{Object, ObjectRef};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Callable),
    Exception(ExceptionRef),
    /// A shared mutable cell. Used for boxed locals, closure slots and
    /// by-reference arguments.
    Ref(ValueRef),
}

/// Shape of a value, used as a call-site cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Array,
    Object(u64),
    Function,
    Exception,
    Ref,
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Array(_) => ValueKind::Array,
            Value::Object(object) => ValueKind::Object(object.class().id()),
            Value::Function(_) => ValueKind::Function,
            Value::Exception(_) => ValueKind::Exception,
            Value::Ref(_) => ValueKind::Ref,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Exception(_) => "exception",
            Value::Ref(_) => "ref",
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Callable> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&ExceptionRef> {
        match self {
            Value::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_ref_cell(&self) -> Option<&ValueRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

/// Structural equality for scalars and strings, identity for everything
/// that has identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items.read().iter()).finish(),
            Value::Object(object) => write!(f, "<{} object>", object.class().name()),
            Value::Function(function) => write!(f, "<function {}>", function.name()),
            Value::Exception(e) => write!(f, "<{}: {}>", e.class().name(), e.message()),
            Value::Ref(_) => write!(f, "<ref>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<ExceptionRef> for Value {
    fn from(e: ExceptionRef) -> Self {
        Value::Exception(e)
    }
}

// ============================================================================
// Reference cells
// ============================================================================

/// A strong box: the storage behind boxed locals and closure variables.
#[derive(Clone, Default)]
pub struct ValueRef(Arc<Mutex<Value>>);

impl ValueRef {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    pub fn ptr_eq(&self, other: &ValueRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({:?})", self.get())
    }
}

static_assertions::assert_impl_all!(Value: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_cells_share_storage() {
        let cell = ValueRef::new(Value::Int(1));
        let alias = cell.clone();
        alias.set(Value::Int(2));
        assert_eq!(cell.get(), Value::Int(2));
        assert!(cell.ptr_eq(&alias));
    }

    #[test]
    fn test_arrays_compare_by_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_format() {
        let v = Value::array(vec![Value::Int(1), Value::str("a"), Value::Null]);
        assert_eq!(format!("{:?}", v), r#"[1, "a", null]"#);
    }
}
