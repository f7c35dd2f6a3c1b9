use crate::types::Type;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

struct VariableData {
    id: u64,
    name: Option<Arc<str>>,
    ty: Type,
    by_ref: bool,
}

/// A parameter or block variable. Identity is the node, not the name: two
/// variables called `x` are distinct.
#[derive(Clone)]
pub struct Variable(Arc<VariableData>);

impl Variable {
    pub fn new(name: &str, ty: Type) -> Self {
        Self(Arc::new(VariableData { id: next_id(), name: Some(name.into()), ty, by_ref: false }))
    }

    pub fn anonymous(ty: Type) -> Self {
        Self(Arc::new(VariableData { id: next_id(), name: None, ty, by_ref: false }))
    }

    /// A by-reference lambda parameter.
    pub fn by_ref(name: &str, ty: Type) -> Self {
        Self(Arc::new(VariableData { id: next_id(), name: Some(name.into()), ty, by_ref: true }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        self.0.name.as_deref().unwrap_or("<anonymous>")
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    pub fn is_by_ref(&self) -> bool {
        self.0.by_ref
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.0.id)
    }
}

struct LabelData {
    id: u64,
    name: Option<Arc<str>>,
    ty: Type,
}

/// Target of gotos and label nodes. A typed target carries a value.
#[derive(Clone)]
pub struct LabelTarget(Arc<LabelData>);

impl LabelTarget {
    pub fn new(name: &str) -> Self {
        Self::typed(name, Type::Void)
    }

    pub fn typed(name: &str, ty: Type) -> Self {
        Self(Arc::new(LabelData { id: next_id(), name: Some(name.into()), ty }))
    }

    pub fn anonymous(ty: Type) -> Self {
        Self(Arc::new(LabelData { id: next_id(), name: None, ty }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        self.0.name.as_deref().unwrap_or("<anonymous>")
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }
}

impl PartialEq for LabelTarget {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for LabelTarget {}

impl Hash for LabelTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for LabelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.0.id)
    }
}
