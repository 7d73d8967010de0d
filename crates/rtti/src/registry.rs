//! The type registry.
//!
//! Maps canonical type names to descriptors. Composite names
//! (`array<…>`, `ptr<…>`, `weak<…>`, `ref<…>`) are resolved structurally,
//! everything else by lookup. Registration is insert-safe; lookups are safe
//! under contention. A process-wide default instance exists, but save/load
//! contexts carry an explicit handle so isolated registries (tests, tools
//! working across schema versions) stay possible.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::class::ClassDef;
use crate::error::RttiError;
use crate::strings::StringId;
use crate::types::{BitfieldDef, CustomTypeDef, EnumDef, SimpleKind, TypeDef};

#[derive(Default)]
struct RegistryInner {
    classes: HashMap<StringId, Arc<ClassDef>>,
    enums: HashMap<StringId, Arc<EnumDef>>,
    bitfields: HashMap<StringId, Arc<BitfieldDef>>,
    customs: HashMap<StringId, Arc<CustomTypeDef>>,
}

pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    pub fn new() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry {
            inner: RwLock::new(RegistryInner::default()),
        })
    }

    /// The process-wide default registry.
    pub fn global() -> &'static Arc<TypeRegistry> {
        static GLOBAL: OnceLock<Arc<TypeRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(TypeRegistry::new)
    }

    pub fn register_class(&self, class: Arc<ClassDef>) -> Result<(), RttiError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.classes.contains_key(&class.name) {
            return Err(RttiError::DuplicateType(class.name.as_str().to_string()));
        }
        inner.classes.insert(class.name, class);
        Ok(())
    }

    pub fn register_enum(&self, def: Arc<EnumDef>) -> Result<(), RttiError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.enums.contains_key(&def.name) {
            return Err(RttiError::DuplicateType(def.name.as_str().to_string()));
        }
        inner.enums.insert(def.name, def);
        Ok(())
    }

    pub fn register_bitfield(&self, def: Arc<BitfieldDef>) -> Result<(), RttiError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.bitfields.contains_key(&def.name) {
            return Err(RttiError::DuplicateType(def.name.as_str().to_string()));
        }
        inner.bitfields.insert(def.name, def);
        Ok(())
    }

    pub fn register_custom(&self, def: Arc<CustomTypeDef>) -> Result<(), RttiError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.customs.contains_key(&def.name) {
            return Err(RttiError::DuplicateType(def.name.as_str().to_string()));
        }
        inner.customs.insert(def.name, def);
        Ok(())
    }

    pub fn find_class(&self, name: StringId) -> Option<Arc<ClassDef>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.classes.get(&name).cloned()
    }

    pub fn find_enum(&self, name: StringId) -> Option<Arc<EnumDef>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.enums.get(&name).cloned()
    }

    pub fn find_bitfield(&self, name: StringId) -> Option<Arc<BitfieldDef>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.bitfields.get(&name).cloned()
    }

    pub fn find_custom(&self, name: StringId) -> Option<Arc<CustomTypeDef>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.customs.get(&name).cloned()
    }

    /// Resolves a canonical type name, composite forms included.
    pub fn find_type(&self, name: StringId) -> Option<TypeDef> {
        self.parse_type_name(name.as_str())
    }

    fn parse_type_name(&self, text: &str) -> Option<TypeDef> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some(kind) = SimpleKind::from_name(text) {
            return Some(TypeDef::Simple(kind));
        }
        match text {
            "classref" => return Some(TypeDef::ClassRef),
            "buffer" => return Some(TypeDef::Buffer),
            "asyncbuffer" => return Some(TypeDef::AsyncBuffer),
            "variant" => return Some(TypeDef::Variant),
            _ => {}
        }

        if let Some(inner) = composite(text, "array<") {
            // fixed-capacity arrays carry a trailing ",N"
            if let Some((element, count)) = split_capacity(inner) {
                let element = self.parse_type_name(element)?;
                return Some(TypeDef::static_array_of(element, count));
            }
            let element = self.parse_type_name(inner)?;
            return Some(TypeDef::array_of(element));
        }
        if let Some(inner) = composite(text, "ptr<") {
            return Some(TypeDef::StrongHandle(StringId::intern(inner)));
        }
        if let Some(inner) = composite(text, "weak<") {
            return Some(TypeDef::WeakHandle(StringId::intern(inner)));
        }
        if let Some(inner) = composite(text, "ref<") {
            return Some(TypeDef::ResourceRef(StringId::intern(inner)));
        }

        let name = StringId::find(text)?;
        let inner = self.inner.read().expect("registry lock poisoned");
        if let Some(def) = inner.enums.get(&name) {
            return Some(TypeDef::Enum(Arc::clone(def)));
        }
        if let Some(def) = inner.bitfields.get(&name) {
            return Some(TypeDef::Bitfield(Arc::clone(def)));
        }
        if let Some(def) = inner.classes.get(&name) {
            return Some(TypeDef::Class(Arc::clone(def)));
        }
        if let Some(def) = inner.customs.get(&name) {
            return Some(TypeDef::Custom(Arc::clone(def)));
        }
        None
    }
}

fn composite<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.strip_prefix(prefix)?.strip_suffix('>')
}

fn split_capacity(inner: &str) -> Option<(&str, u32)> {
    // the capacity is the part after the last comma at nesting depth zero
    let mut depth = 0usize;
    for (pos, ch) in inner.char_indices().rev() {
        match ch {
            '>' => depth += 1,
            '<' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let count = inner[pos + 1..].trim().parse().ok()?;
                return Some((&inner[..pos], count));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PropertyDef;

    #[test]
    fn test_register_and_find() {
        let registry = TypeRegistry::new();
        let cls = ClassDef::build("test.RegistryNode")
            .prop(PropertyDef::new("x", TypeDef::Simple(SimpleKind::F32)))
            .finish();
        registry.register_class(Arc::clone(&cls)).unwrap();
        assert!(registry.register_class(cls).is_err());

        let found = registry.find_class(StringId::intern("test.RegistryNode")).unwrap();
        assert_eq!(found.name.as_str(), "test.RegistryNode");
    }

    #[test]
    fn test_find_type_composites() {
        let registry = TypeRegistry::new();
        registry
            .register_enum(EnumDef::new("test.RegistryEnum", &[("A", 0)]))
            .unwrap();

        let ty = registry
            .find_type(StringId::intern("array<test.RegistryEnum>"))
            .unwrap();
        assert_eq!(ty.name().as_str(), "array<test.RegistryEnum>");

        let ty = registry.find_type(StringId::intern("array<f32,4>")).unwrap();
        assert!(matches!(ty, TypeDef::Array { capacity: Some(4), .. }));

        let ty = registry.find_type(StringId::intern("ptr<test.Missing>")).unwrap();
        assert!(matches!(ty, TypeDef::StrongHandle(_)));

        let ty = registry
            .find_type(StringId::intern("array<array<u8>,3>"))
            .unwrap();
        match ty {
            TypeDef::Array { element, capacity } => {
                assert_eq!(capacity, Some(3));
                assert_eq!(element.name().as_str(), "array<u8>");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_none() {
        let registry = TypeRegistry::new();
        assert!(registry.find_type(StringId::intern("test.NoSuchType")).is_none());
        assert!(registry.find_type(StringId::intern("")).is_none());
    }

    #[test]
    fn test_roundtrip_names() {
        let registry = TypeRegistry::new();
        for ty in [
            TypeDef::Simple(SimpleKind::F64),
            TypeDef::array_of(TypeDef::Simple(SimpleKind::Bool)),
            TypeDef::static_array_of(TypeDef::Simple(SimpleKind::F32), 16),
            TypeDef::WeakHandle(StringId::intern("test.RoundtripTarget")),
            TypeDef::Variant,
            TypeDef::Buffer,
        ] {
            let resolved = registry.find_type(ty.name()).unwrap();
            assert_eq!(resolved.name(), ty.name());
        }
    }
}
