//! Reflected object instances.
//!
//! An [`Object`] is an instance of a reflected class: one dynamically typed
//! slot per declared property. Objects live behind `Arc<RwLock<…>>`; the
//! `Arc` identity is the object identity, weak handles observe without
//! keeping the object alive.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use uuid::Uuid;

use crate::class::ClassDef;
use crate::error::RttiError;
use crate::resource::ResourceId;
use crate::strings::StringId;
use crate::value::{values_deep_eq, Value};

/// Strong, owning handle. Strong reachability from a root drives
/// serialization.
pub type ObjectRef = Arc<RwLock<Object>>;

/// Non-owning observer handle; upgradeable only while the object lives.
#[derive(Clone, Default)]
pub struct ObjectWeak(Weak<RwLock<Object>>);

impl ObjectWeak {
    pub fn new() -> ObjectWeak {
        ObjectWeak(Weak::new())
    }

    pub fn from_ref(object: &ObjectRef) -> ObjectWeak {
        ObjectWeak(Arc::downgrade(object))
    }

    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade()
    }
}

impl fmt::Debug for ObjectWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(_) => write!(f, "ObjectWeak(alive)"),
            None => write!(f, "ObjectWeak(dead)"),
        }
    }
}

fn next_object_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An owned instance of a reflected class.
pub struct Object {
    class: Arc<ClassDef>,
    id: u64,
    event_key: Uuid,
    parent: ObjectWeak,
    values: Vec<Value>,
    resource_id: Option<ResourceId>,
    load_path: Option<String>,
}

impl Object {
    /// Constructs a default-initialized instance. Abstract classes are
    /// rejected.
    pub fn create(class: &Arc<ClassDef>) -> Result<ObjectRef, RttiError> {
        if class.is_abstract {
            return Err(RttiError::AbstractClass(class.name.as_str().to_string()));
        }
        let values = class
            .properties()
            .iter()
            .map(|prop| prop.default_value())
            .collect();
        Ok(Arc::new(RwLock::new(Object {
            class: Arc::clone(class),
            id: next_object_id(),
            event_key: Uuid::new_v4(),
            parent: ObjectWeak::new(),
            values,
            resource_id: None,
            load_path: None,
        })))
    }

    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Globally unique event key, minted at construction.
    pub fn event_key(&self) -> Uuid {
        self.event_key
    }

    pub fn parent(&self) -> Option<ObjectRef> {
        self.parent.upgrade()
    }

    pub fn set_parent(&mut self, parent: &ObjectRef) {
        self.parent = ObjectWeak::from_ref(parent);
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn set_value_at(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = StringId::find(name)?;
        let (index, _) = self.class.find_property(name)?;
        self.values.get(index)
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), RttiError> {
        let id = StringId::intern(name);
        let (index, _) = self
            .class
            .find_property(id)
            .ok_or_else(|| RttiError::UnknownProperty {
                class: self.class.name.as_str().to_string(),
                property: name.to_string(),
            })?;
        self.values[index] = value;
        Ok(())
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        self.resource_id
    }

    pub fn set_resource_id(&mut self, id: ResourceId) {
        self.resource_id = Some(id);
    }

    pub fn load_path(&self) -> Option<&str> {
        self.load_path.as_deref()
    }

    /// Binds the path the object was loaded from (resources only).
    pub fn bind_load_path(&mut self, path: &str) {
        self.load_path = Some(path.to_string());
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({} #{})", self.class.name, self.id)
    }
}

/// Runs the class post-load hook on `object`.
pub fn run_post_load(object: &ObjectRef) {
    let hook = {
        let guard = object.read().expect("object lock poisoned");
        guard.class().hooks.post_load.clone()
    };
    if let Some(hook) = hook {
        let mut guard = object.write().expect("object lock poisoned");
        hook(&mut guard);
    }
}

/// Structural equality between two object graphs.
///
/// Objects compare by class and property values; handle identity on one
/// side must correspond to handle identity on the other. Cycles terminate
/// through the visited pair set.
pub fn objects_deep_eq(a: &ObjectRef, b: &ObjectRef) -> bool {
    let mut visited = HashSet::new();
    objects_deep_eq_inner(a, b, &mut visited)
}

pub(crate) fn objects_deep_eq_inner(
    a: &ObjectRef,
    b: &ObjectRef,
    visited: &mut HashSet<(u64, u64)>,
) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    let a_guard = a.read().expect("object lock poisoned");
    let b_guard = b.read().expect("object lock poisoned");

    // a revisited pair is already being compared higher up the stack
    if !visited.insert((a_guard.id, b_guard.id)) {
        return true;
    }

    if a_guard.class.name != b_guard.class.name {
        return false;
    }
    if a_guard.values.len() != b_guard.values.len() {
        return false;
    }
    a_guard
        .values
        .iter()
        .zip(b_guard.values.iter())
        .all(|(va, vb)| values_deep_eq(va, vb, visited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDef, PropertyDef};
    use crate::types::{SimpleKind, TypeDef};

    fn simple_class(name: &str) -> Arc<ClassDef> {
        ClassDef::build(name)
            .prop(PropertyDef::new("value", TypeDef::Simple(SimpleKind::I32)))
            .finish()
    }

    #[test]
    fn test_create_initializes_defaults() {
        let cls = simple_class("test.ObjectDefaults");
        let obj = Object::create(&cls).unwrap();
        let guard = obj.read().unwrap();
        assert_eq!(guard.get("value"), Some(&Value::I32(0)));
    }

    #[test]
    fn test_abstract_class_rejected() {
        let cls = ClassDef::build("test.AbstractThing").abstract_class().finish();
        assert!(Object::create(&cls).is_err());
    }

    #[test]
    fn test_unique_ids() {
        let cls = simple_class("test.ObjectIds");
        let a = Object::create(&cls).unwrap();
        let b = Object::create(&cls).unwrap();
        assert_ne!(a.read().unwrap().id(), b.read().unwrap().id());
        assert_ne!(a.read().unwrap().event_key(), b.read().unwrap().event_key());
    }

    #[test]
    fn test_set_get() {
        let cls = simple_class("test.ObjectSetGet");
        let obj = Object::create(&cls).unwrap();
        obj.write().unwrap().set("value", Value::I32(42)).unwrap();
        assert_eq!(obj.read().unwrap().get("value"), Some(&Value::I32(42)));
        assert!(obj.write().unwrap().set("missing", Value::I32(1)).is_err());
    }

    #[test]
    fn test_parent_is_weak() {
        let cls = simple_class("test.ObjectParent");
        let child = Object::create(&cls).unwrap();
        {
            let parent = Object::create(&cls).unwrap();
            child.write().unwrap().set_parent(&parent);
            assert!(child.read().unwrap().parent().is_some());
        }
        assert!(child.read().unwrap().parent().is_none());
    }

    #[test]
    fn test_deep_eq() {
        let cls = simple_class("test.ObjectEq");
        let a = Object::create(&cls).unwrap();
        let b = Object::create(&cls).unwrap();
        assert!(objects_deep_eq(&a, &b));
        b.write().unwrap().set("value", Value::I32(7)).unwrap();
        assert!(!objects_deep_eq(&a, &b));
    }
}
