//! Static types carried by tree nodes and consulted at run time for type
//! tests, casts and handler matching.
//!
//! Types are cheap to clone: every compound type is behind an `Arc`, and
//! user classes compare by identity.

mod class;

pub use class::{
    Class, ClassBuilder, ExceptionClass, FieldInfo, Method, MethodBody, MethodKind, ParamInfo,
    builtin,
};

use crate::values::Value;
use std::fmt;
use std::sync::Arc;

/// A static type.
#[derive(Clone)]
pub enum Type {
    Void,
    Bool,
    Int,
    Float,
    Str,
    Array(Arc<Type>),
    Object(Arc<Class>),
    Exception(Arc<ExceptionClass>),
    Function(Arc<Signature>),
    /// A by-reference slot holding a value of the inner type.
    Ref(Arc<Type>),
    /// Top type. Accepts every value.
    Any,
}

/// Parameter and return types of a callable.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }
}

impl Type {
    pub fn array(element: Type) -> Self {
        Type::Array(Arc::new(element))
    }

    pub fn function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function(Arc::new(Signature::new(params, ret)))
    }

    pub fn reference(inner: Type) -> Self {
        Type::Ref(Arc::new(inner))
    }

    pub fn exception() -> Self {
        Type::Exception(Arc::clone(&builtin::EXCEPTION))
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Element type of an array type.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(element) => Some(element),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Type::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Static assignability: can a value of type `other` be stored in a
    /// slot of type `self`?
    pub fn is_assignable_from(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Any, _) => true,
            (Type::Object(target), Type::Object(source)) => source.is_subclass_of(target),
            (Type::Exception(target), Type::Exception(source)) => target.is_assignable_from(source),
            (Type::Array(target), Type::Array(source)) => target.is_assignable_from(source),
            (Type::Ref(target), Type::Ref(source)) => target == source,
            _ => self == other,
        }
    }

    /// Dynamic type test used by `TypeIs`, `TypeAs` and casts. Null is
    /// accepted by every reference type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Type::Any, _) => true,
            (Type::Void, _) => false,
            (Type::Bool, Value::Bool(_)) => true,
            (Type::Int, Value::Int(_)) => true,
            (Type::Float, Value::Float(_)) => true,
            (
                Type::Str | Type::Array(_) | Type::Object(_) | Type::Exception(_) | Type::Function(_),
                Value::Null,
            ) => true,
            (Type::Str, Value::Str(_)) => true,
            (Type::Array(_), Value::Array(_)) => true,
            (Type::Object(class), Value::Object(object)) => object.class().is_subclass_of(class),
            (Type::Exception(class), Value::Exception(exception)) => {
                class.is_assignable_from(exception.class())
            }
            (Type::Function(_), Value::Function(_)) => true,
            (Type::Ref(_), Value::Ref(_)) => true,
            _ => false,
        }
    }

    /// Value a freshly declared variable of this type starts with.
    pub fn default_value(&self) -> Value {
        match self {
            Type::Bool => Value::Bool(false),
            Type::Int => Value::Int(0),
            Type::Float => Value::Float(0.0),
            _ => Value::Null,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Void, Type::Void)
            | (Type::Bool, Type::Bool)
            | (Type::Int, Type::Int)
            | (Type::Float, Type::Float)
            | (Type::Str, Type::Str)
            | (Type::Any, Type::Any) => true,
            (Type::Array(a), Type::Array(b)) | (Type::Ref(a), Type::Ref(b)) => a == b,
            (Type::Object(a), Type::Object(b)) => Arc::ptr_eq(a, b),
            (Type::Exception(a), Type::Exception(b)) => Arc::ptr_eq(a, b),
            (Type::Function(a), Type::Function(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Array(element) => write!(f, "{}[]", element),
            Type::Object(class) => write!(f, "{}", class.name()),
            Type::Exception(class) => write!(f, "{}", class.name()),
            Type::Function(sig) => {
                write!(f, "(")?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ") => {}", sig.ret)
            }
            Type::Ref(inner) => write!(f, "ref {}", inner),
            Type::Any => write!(f, "any"),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
