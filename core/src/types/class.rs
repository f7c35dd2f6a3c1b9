//! User classes, host methods and exception classes.

use super::Type;
use crate::values::Value;
use crate::vm::{ExecutionContext, Fault};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

fn next_class_id() -> u64 {
    NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Methods
// ============================================================================

/// Host implementation of a method. Receives the receiver (`None` for
/// static methods) and a mutable argument buffer; by-reference parameters
/// are written back from the buffer after the call returns.
pub type MethodBody =
    Arc<dyn Fn(&mut ExecutionContext, Option<&Value>, &mut [Value]) -> Result<Value, Fault> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Static,
    Instance,
    /// Resolved against the receiver's class at the call site.
    Virtual,
}

#[derive(Clone, Debug)]
pub struct ParamInfo {
    pub name: Arc<str>,
    pub ty: Type,
    pub by_ref: bool,
}

impl ParamInfo {
    pub fn new(name: &str, ty: Type) -> Self {
        Self { name: name.into(), ty, by_ref: false }
    }

    pub fn by_ref(name: &str, ty: Type) -> Self {
        Self { name: name.into(), ty, by_ref: true }
    }
}

pub struct Method {
    name: Arc<str>,
    kind: MethodKind,
    params: Vec<ParamInfo>,
    ret: Type,
    body: MethodBody,
}

impl Method {
    pub fn new<F>(name: &str, kind: MethodKind, params: Vec<ParamInfo>, ret: Type, body: F) -> Arc<Self>
    where
        F: Fn(&mut ExecutionContext, Option<&Value>, &mut [Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Arc::new(Self { name: name.into(), kind, params, ret, body: Arc::new(body) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    pub fn ret(&self) -> &Type {
        &self.ret
    }

    pub fn has_receiver(&self) -> bool {
        self.kind != MethodKind::Static
    }

    pub fn has_by_ref_params(&self) -> bool {
        self.params.iter().any(|p| p.by_ref)
    }

    pub fn invoke(
        &self,
        ctx: &mut ExecutionContext,
        receiver: Option<&Value>,
        args: &mut [Value],
    ) -> Result<Value, Fault> {
        (self.body)(ctx, receiver, args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}", self.kind, self.name, self.params.len())
    }
}

// ============================================================================
// Classes
// ============================================================================

#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: Arc<str>,
    pub ty: Type,
}

/// A user class: positional fields (inherited ones first) and methods.
pub struct Class {
    id: u64,
    name: Arc<str>,
    parent: Option<Arc<Class>>,
    fields: Vec<FieldInfo>,
    methods: Vec<Arc<Method>>,
}

impl Class {
    pub fn builder(name: &str) -> ClassBuilder {
        ClassBuilder { name: name.into(), parent: None, fields: Vec::new(), methods: Vec::new() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Class>> {
        self.parent.as_ref()
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| &*f.name == name)
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class.id == other.id {
                return true;
            }
            current = class.parent.as_deref();
        }
        false
    }

    /// Declared method lookup, own class first then ancestors. Virtual
    /// dispatch calls this on the receiver's runtime class.
    pub fn find_method(&self, name: &str) -> Option<&Arc<Method>> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(method) = class.methods.iter().find(|m| m.name() == name) {
                return Some(method);
            }
            current = class.parent.as_deref();
        }
        None
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.name)
    }
}

pub struct ClassBuilder {
    name: Arc<str>,
    parent: Option<Arc<Class>>,
    fields: Vec<FieldInfo>,
    methods: Vec<Arc<Method>>,
}

impl ClassBuilder {
    pub fn extends(mut self, parent: &Arc<Class>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn field(mut self, name: &str, ty: Type) -> Self {
        self.fields.push(FieldInfo { name: name.into(), ty });
        self
    }

    pub fn method(mut self, method: Arc<Method>) -> Self {
        self.methods.push(method);
        self
    }

    pub fn build(self) -> Arc<Class> {
        let mut fields = self.parent.as_ref().map(|p| p.fields.clone()).unwrap_or_default();
        fields.extend(self.fields);
        Arc::new(Class {
            id: next_class_id(),
            name: self.name,
            parent: self.parent,
            fields,
            methods: self.methods,
        })
    }
}

// ============================================================================
// Exception classes
// ============================================================================

/// An exception class. Handlers match by walking the thrown class's parent
/// chain.
pub struct ExceptionClass {
    id: u64,
    name: Arc<str>,
    parent: Option<Arc<ExceptionClass>>,
}

impl ExceptionClass {
    pub fn root(name: &str) -> Arc<Self> {
        Arc::new(Self { id: next_class_id(), name: name.into(), parent: None })
    }

    pub fn new(name: &str, parent: &Arc<ExceptionClass>) -> Arc<Self> {
        Arc::new(Self { id: next_class_id(), name: name.into(), parent: Some(Arc::clone(parent)) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ExceptionClass>> {
        self.parent.as_ref()
    }

    pub fn is_assignable_from(&self, other: &ExceptionClass) -> bool {
        let mut current = Some(other);
        while let Some(class) = current {
            if class.id == self.id {
                return true;
            }
            current = class.parent.as_deref();
        }
        false
    }

    pub fn is_abort(&self) -> bool {
        self.id == builtin::EXECUTION_ABORTED.id
    }
}

impl fmt::Debug for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Exception classes raised by the runtime itself.
pub mod builtin {
    use super::ExceptionClass;
    use once_cell::sync::Lazy;
    use std::sync::Arc;

    pub static EXCEPTION: Lazy<Arc<ExceptionClass>> = Lazy::new(|| ExceptionClass::root("Exception"));
    pub static ARITHMETIC: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("ArithmeticException", &EXCEPTION));
    pub static DIVIDE_BY_ZERO: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("DivideByZeroException", &ARITHMETIC));
    pub static INVALID_CAST: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("InvalidCastException", &EXCEPTION));
    pub static INDEX_OUT_OF_RANGE: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("IndexOutOfRangeException", &EXCEPTION));
    pub static NULL_REFERENCE: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("NullReferenceException", &EXCEPTION));
    pub static ARGUMENT: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("ArgumentException", &EXCEPTION));
    pub static MISSING_MEMBER: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("MissingMemberException", &EXCEPTION));
    pub static INSUFFICIENT_EXECUTION_STACK: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("InsufficientExecutionStackException", &EXCEPTION));
    pub static EXECUTION_ABORTED: Lazy<Arc<ExceptionClass>> =
        Lazy::new(|| ExceptionClass::new("ExecutionAbortedException", &EXCEPTION));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_inherited_first() {
        let base = Class::builder("Base").field("a", Type::Int).build();
        let derived = Class::builder("Derived").extends(&base).field("b", Type::Str).build();
        assert_eq!(derived.field_index("a"), Some(0));
        assert_eq!(derived.field_index("b"), Some(1));
        assert!(derived.is_subclass_of(&base));
        assert!(!base.is_subclass_of(&derived));
    }

    #[test]
    fn test_find_method_prefers_override() {
        let speak = |text: &'static str| {
            Method::new("speak", MethodKind::Virtual, vec![], Type::Str, move |_, _, _| Ok(Value::from(text)))
        };
        let base = Class::builder("Animal").method(speak("...")).build();
        let derived = Class::builder("Dog").extends(&base).method(speak("woof")).build();
        let mut ctx = ExecutionContext::new();
        let method = derived.find_method("speak").map(Arc::clone);
        let result = method.map(|m| m.invoke(&mut ctx, None, &mut []));
        assert!(matches!(result, Some(Ok(Value::Str(s))) if &*s == "woof"));
    }

    #[test]
    fn test_abort_class_identity() {
        assert!(builtin::EXECUTION_ABORTED.is_abort());
        assert!(!builtin::EXCEPTION.is_abort());
        assert!(builtin::EXCEPTION.is_assignable_from(&builtin::EXECUTION_ABORTED));
    }
}
