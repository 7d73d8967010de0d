//! Reference-counting pre-pass for text serialization.
//!
//! The tree formats need to know, before emitting anything, which objects
//! are referenced more than once: those get an integer id at their first
//! (strong) appearance and `refId` back-references afterwards. This writer
//! implementation renders nothing; it only walks the graph and counts.

use std::collections::HashMap;
use std::sync::Arc;

use rtti::{ObjectRef, ResourceKey, ResourceRefValue};
use tracing::warn;

use crate::text::writer::{write_object_body, TextValueWriter};

#[derive(Clone, Copy, Debug, Default)]
pub struct MappedObjectInfo {
    pub strong_refs: u32,
    pub weak_refs: u32,
    /// Assigned once an object needs to be addressable; first id is 1.
    pub index: Option<u32>,
}

/// Result of the mapping pass, consumed by the rendering writers.
#[derive(Default)]
pub struct TextObjectMap {
    pub objects: HashMap<u64, MappedObjectInfo>,
    /// Objects kept alive for the rendering pass.
    pub references: Vec<ObjectRef>,
    /// External resource keys the graph mentions.
    pub resources: Vec<ResourceKey>,
}

impl TextObjectMap {
    pub fn info(&self, object_id: u64) -> Option<&MappedObjectInfo> {
        self.objects.get(&object_id)
    }
}

pub struct TextObjectMapper {
    map: TextObjectMap,
    next_index: u32,
}

impl TextObjectMapper {
    pub fn new() -> TextObjectMapper {
        TextObjectMapper {
            map: TextObjectMap::default(),
            next_index: 1,
        }
    }

    pub fn finish(self) -> TextObjectMap {
        self.map
    }
}

impl Default for TextObjectMapper {
    fn default() -> Self {
        TextObjectMapper::new()
    }
}

impl TextValueWriter for TextObjectMapper {
    fn begin_array_element(&mut self) {}
    fn end_array_element(&mut self) {}
    fn begin_struct_element(&mut self, _name: &str) {}
    fn end_struct_element(&mut self) {}
    fn write_value_text(&mut self, _text: &str) {}
    fn write_value_bytes(&mut self, _data: &[u8]) {}

    fn write_value_object(&mut self, object: Option<&ObjectRef>, strong: bool) {
        let Some(object) = object else {
            return;
        };
        let id = object.read().expect("object lock poisoned").id();

        let known = self.map.objects.contains_key(&id);
        let info = self.map.objects.entry(id).or_default();
        if strong {
            info.strong_refs += 1;
        } else {
            info.weak_refs += 1;
        }
        // addressable = defined once and referenced again
        if info.strong_refs > 0
            && info.strong_refs + info.weak_refs > 1
            && info.index.is_none()
        {
            info.index = Some(self.next_index);
            self.next_index += 1;
        }

        if !known {
            self.map.references.push(Arc::clone(object));
            if let Err(error) = write_object_body(self, object) {
                warn!(%error, "mapping pass failed to walk object");
            }
        }
    }

    fn write_value_resource(&mut self, resource: &ResourceRefValue) {
        match resource {
            ResourceRefValue::Inlined(object) => {
                self.write_value_object(Some(object), true);
            }
            ResourceRefValue::External { key, .. } => {
                self.map.resources.push(*key);
            }
            ResourceRefValue::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::writer::write_value_text;
    use rtti::{ClassDef, Object, PropertyDef, SimpleKind, StringId, TypeDef, Value};

    fn node_class() -> Arc<ClassDef> {
        ClassDef::build("test.MapperNode")
            .prop(PropertyDef::new("value", TypeDef::Simple(SimpleKind::I32)))
            .prop(PropertyDef::new(
                "children",
                TypeDef::array_of(TypeDef::StrongHandle(StringId::intern("test.MapperNode"))),
            ))
            .finish()
    }

    #[test]
    fn test_single_reference_gets_no_id() {
        let cls = node_class();
        let root = Object::create(&cls).unwrap();

        let mut mapper = TextObjectMapper::new();
        mapper.write_value_object(Some(&root), true);
        let map = mapper.finish();

        let root_id = root.read().unwrap().id();
        assert_eq!(map.info(root_id).unwrap().index, None);
    }

    #[test]
    fn test_shared_object_gets_id_one() {
        let cls = node_class();
        let root = Object::create(&cls).unwrap();
        let shared = Object::create(&cls).unwrap();
        shared.write().unwrap().set("value", Value::I32(42)).unwrap();
        root.write()
            .unwrap()
            .set(
                "children",
                Value::Array(vec![Value::object(&shared), Value::object(&shared)]),
            )
            .unwrap();

        let ty = TypeDef::StrongHandle(StringId::intern("test.MapperNode"));
        let mut mapper = TextObjectMapper::new();
        write_value_text(&mut mapper, &ty, &Value::object(&root)).unwrap();
        let map = mapper.finish();

        let shared_id = shared.read().unwrap().id();
        let info = map.info(shared_id).unwrap();
        assert_eq!(info.strong_refs, 2);
        assert_eq!(info.index, Some(1));

        let root_info = map.info(root.read().unwrap().id()).unwrap();
        assert_eq!(root_info.index, None);
    }
}
