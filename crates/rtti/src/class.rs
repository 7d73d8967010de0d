//! Class and property metadata.

use std::fmt;
use std::sync::Arc;

use crate::object::Object;
use crate::strings::StringId;
use crate::types::TypeDef;
use crate::value::Value;

/// A named, typed member of a class.
#[derive(Clone, Debug)]
pub struct PropertyDef {
    pub name: StringId,
    pub ty: TypeDef,
    pub editable: bool,
    /// Transient properties never reach the wire.
    pub transient: bool,
    pub scripted: bool,
    /// Overrides the type's zero default for suppression comparisons.
    pub default: Option<Value>,
}

impl PropertyDef {
    pub fn new(name: &str, ty: TypeDef) -> PropertyDef {
        PropertyDef {
            name: StringId::intern(name),
            ty,
            editable: true,
            transient: false,
            scripted: false,
            default: None,
        }
    }

    pub fn transient(mut self) -> PropertyDef {
        self.transient = true;
        self
    }

    pub fn scripted(mut self) -> PropertyDef {
        self.scripted = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> PropertyDef {
        self.default = Some(default);
        self
    }

    /// The value a freshly constructed object carries in this slot.
    pub fn default_value(&self) -> Value {
        match &self.default {
            Some(value) => value.clone(),
            None => self.ty.default_value(),
        }
    }
}

/// Called after an object's payload has been applied, in export order.
pub type PostLoadHook = Arc<dyn Fn(&mut Object) + Send + Sync>;

/// Offered a property that the wire carries but the class no longer
/// declares. `value` is present when the recorded type could still be
/// decoded. Returning true absorbs the error.
pub type PropertyMissingHook =
    Arc<dyn Fn(&mut Object, StringId, Option<&Value>) -> bool + Send + Sync>;

/// Offered a property whose recorded type differs from the declared one.
/// Returning true absorbs the error.
pub type PropertyTypeChangedHook =
    Arc<dyn Fn(&mut Object, StringId, &Value) -> bool + Send + Sync>;

#[derive(Default, Clone)]
pub struct ClassHooks {
    pub post_load: Option<PostLoadHook>,
    pub property_missing: Option<PropertyMissingHook>,
    pub property_type_changed: Option<PropertyTypeChangedHook>,
}

/// A reflected class: an ordered collection of named properties, possibly
/// inheriting from a base class.
pub struct ClassDef {
    pub name: StringId,
    pub base: Option<Arc<ClassDef>>,
    pub is_abstract: bool,
    pub is_resource: bool,
    pub hooks: ClassHooks,
    /// Properties declared by this class only.
    own_properties: Vec<PropertyDef>,
    /// Full declaration-order list, inherited properties first.
    all_properties: Vec<PropertyDef>,
}

impl ClassDef {
    pub fn build(name: &str) -> ClassBuilder {
        ClassBuilder {
            name: StringId::intern(name),
            base: None,
            is_abstract: false,
            is_resource: false,
            hooks: ClassHooks::default(),
            properties: Vec::new(),
        }
    }

    /// All serialized properties in declaration order, base class first.
    pub fn properties(&self) -> &[PropertyDef] {
        &self.all_properties
    }

    pub fn own_properties(&self) -> &[PropertyDef] {
        &self.own_properties
    }

    pub fn find_property(&self, name: StringId) -> Option<(usize, &PropertyDef)> {
        self.all_properties
            .iter()
            .enumerate()
            .find(|(_, prop)| prop.name == name)
    }

    /// Whether this class is `ancestor` or inherits from it.
    pub fn is_a(&self, ancestor: StringId) -> bool {
        if self.name == ancestor {
            return true;
        }
        let mut base = self.base.as_ref();
        while let Some(cls) = base {
            if cls.name == ancestor {
                return true;
            }
            base = cls.base.as_ref();
        }
        false
    }

    pub fn constructible(&self) -> bool {
        !self.is_abstract
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassDef({})", self.name)
    }
}

pub struct ClassBuilder {
    name: StringId,
    base: Option<Arc<ClassDef>>,
    is_abstract: bool,
    is_resource: bool,
    hooks: ClassHooks,
    properties: Vec<PropertyDef>,
}

impl ClassBuilder {
    pub fn base(mut self, base: &Arc<ClassDef>) -> Self {
        self.base = Some(Arc::clone(base));
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn resource(mut self) -> Self {
        self.is_resource = true;
        self
    }

    pub fn prop(mut self, prop: PropertyDef) -> Self {
        self.properties.push(prop);
        self
    }

    pub fn on_post_load(mut self, hook: PostLoadHook) -> Self {
        self.hooks.post_load = Some(hook);
        self
    }

    pub fn on_property_missing(mut self, hook: PropertyMissingHook) -> Self {
        self.hooks.property_missing = Some(hook);
        self
    }

    pub fn on_property_type_changed(mut self, hook: PropertyTypeChangedHook) -> Self {
        self.hooks.property_type_changed = Some(hook);
        self
    }

    pub fn finish(self) -> Arc<ClassDef> {
        let mut all_properties = Vec::new();
        if let Some(base) = &self.base {
            all_properties.extend(base.all_properties.iter().cloned());
        }
        all_properties.extend(self.properties.iter().cloned());

        let is_resource =
            self.is_resource || self.base.as_ref().map_or(false, |b| b.is_resource);

        Arc::new(ClassDef {
            name: self.name,
            base: self.base,
            is_abstract: self.is_abstract,
            is_resource,
            hooks: self.hooks,
            own_properties: self.properties,
            all_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimpleKind;

    #[test]
    fn test_inherited_properties_come_first() {
        let base = ClassDef::build("test.Base")
            .prop(PropertyDef::new("a", TypeDef::Simple(SimpleKind::I32)))
            .finish();
        let derived = ClassDef::build("test.Derived")
            .base(&base)
            .prop(PropertyDef::new("b", TypeDef::Simple(SimpleKind::F32)))
            .finish();

        let names: Vec<_> = derived
            .properties()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b"]);
        assert!(derived.is_a(StringId::intern("test.Base")));
        assert!(!base.is_a(StringId::intern("test.Derived")));
    }

    #[test]
    fn test_resource_flag_inherits() {
        let base = ClassDef::build("test.BaseRes").resource().finish();
        let derived = ClassDef::build("test.DerivedRes").base(&base).finish();
        assert!(derived.is_resource);
    }

    #[test]
    fn test_find_property() {
        let cls = ClassDef::build("test.Finder")
            .prop(PropertyDef::new("x", TypeDef::Simple(SimpleKind::F32)))
            .prop(PropertyDef::new("y", TypeDef::Simple(SimpleKind::F32)))
            .finish();
        let (index, prop) = cls.find_property(StringId::intern("y")).unwrap();
        assert_eq!(index, 1);
        assert_eq!(prop.name.as_str(), "y");
        assert!(cls.find_property(StringId::intern("z")).is_none());
    }
}
