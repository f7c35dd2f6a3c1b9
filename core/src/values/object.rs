use super::Value;
use crate::types::Class;
use parking_lot::RwLock;
use std::sync::Arc;

pub type ObjectRef = Arc<Object>;

/// An instance of a user class. Fields are positional, in the order of
/// `Class::fields`.
pub struct Object {
    class: Arc<Class>,
    fields: RwLock<Vec<Value>>,
}

impl Object {
    pub fn new(class: &Arc<Class>, fields: Vec<Value>) -> ObjectRef {
        debug_assert_eq!(fields.len(), class.fields().len());
        Arc::new(Self { class: Arc::clone(class), fields: RwLock::new(fields) })
    }

    /// Instance with every field at its type's default value.
    pub fn with_defaults(class: &Arc<Class>) -> ObjectRef {
        let fields = class.fields().iter().map(|f| f.ty.default_value()).collect();
        Self::new(class, fields)
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    pub fn field(&self, index: usize) -> Option<Value> {
        self.fields.read().get(index).cloned()
    }

    pub fn set_field(&self, index: usize, value: Value) -> bool {
        match self.fields.write().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
