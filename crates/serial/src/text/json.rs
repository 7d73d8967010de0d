//! JSON rendering of the text vocabulary (writer only).

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rtti::{ObjectRef, ResourceRefValue};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::text::mapper::TextObjectMap;
use crate::text::writer::{object_class_name, write_object_body, TextValueWriter};

/// Builds a `serde_json` tree for one save operation; mirrors the XML
/// writer's object identity handling.
pub struct JsonTextWriter<'m> {
    map: &'m TextObjectMap,
    stack: Vec<(Option<String>, JsonValue)>,
    defined: HashSet<u64>,
}

impl<'m> JsonTextWriter<'m> {
    pub fn new(map: &'m TextObjectMap) -> JsonTextWriter<'m> {
        JsonTextWriter {
            map,
            stack: vec![(None, JsonValue::Null)],
            defined: HashSet::new(),
        }
    }

    pub fn finish(mut self) -> JsonValue {
        debug_assert_eq!(self.stack.len(), 1, "unbalanced element nesting");
        self.stack.pop().expect("writer always has a root").1
    }

    fn current(&mut self) -> &mut JsonValue {
        &mut self.stack.last_mut().expect("writer always has a node").1
    }

    fn ensure_object(&mut self) -> &mut Map<String, JsonValue> {
        let current = self.current();
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        current.as_object_mut().expect("just ensured an object")
    }

    fn set_attr(&mut self, key: &str, value: JsonValue) {
        self.ensure_object().insert(key.to_string(), value);
    }
}

impl TextValueWriter for JsonTextWriter<'_> {
    fn begin_array(&mut self) {
        *self.current() = JsonValue::Array(Vec::new());
    }

    fn begin_array_element(&mut self) {
        self.stack.push((None, JsonValue::Null));
    }

    fn end_array_element(&mut self) {
        let (_, value) = self.stack.pop().expect("writer always has a node");
        match self.current() {
            JsonValue::Array(items) => items.push(value),
            other => warn!("array element outside an array: {other:?}"),
        }
    }

    fn begin_struct(&mut self) {
        self.ensure_object();
    }

    fn begin_struct_element(&mut self, name: &str) {
        self.stack.push((Some(name.to_string()), JsonValue::Null));
    }

    fn end_struct_element(&mut self) {
        let (name, value) = self.stack.pop().expect("writer always has a node");
        let name = name.expect("struct element carries its name");
        self.ensure_object().insert(name, value);
    }

    fn write_value_text(&mut self, text: &str) {
        *self.current() = JsonValue::String(text.to_string());
    }

    fn write_value_bytes(&mut self, data: &[u8]) {
        *self.current() = JsonValue::String(BASE64_STANDARD.encode(data));
    }

    fn write_value_object(&mut self, object: Option<&ObjectRef>, strong: bool) {
        let Some(object) = object else {
            *self.current() = JsonValue::Null;
            return;
        };
        let id = object.read().expect("object lock poisoned").id();
        let Some(info) = self.map.info(id) else {
            warn!("object was not seen by the mapping pass");
            *self.current() = JsonValue::Null;
            return;
        };

        if strong && self.defined.insert(id) {
            let class = object_class_name(object);
            self.set_attr("class", JsonValue::String(class.as_str().to_string()));
            if let Some(index) = info.index {
                self.set_attr("id", JsonValue::from(index));
            }
            if let Err(error) = write_object_body(self, object) {
                warn!(%error, "object body failed to render");
            }
        } else if info.strong_refs > 0 {
            match info.index {
                Some(index) => self.set_attr("refId", JsonValue::from(index)),
                None => {
                    warn!("shared object without an assigned id");
                    *self.current() = JsonValue::Null;
                }
            }
        } else {
            *self.current() = JsonValue::Null;
        }
    }

    fn write_value_resource(&mut self, resource: &ResourceRefValue) {
        match resource {
            ResourceRefValue::None => *self.current() = JsonValue::Null,
            ResourceRefValue::Inlined(object) => self.write_value_object(Some(object), true),
            ResourceRefValue::External { key, .. } => {
                self.set_attr("class", JsonValue::String(key.class.as_str().to_string()));
                self.set_attr("guid", JsonValue::String(key.id.to_string()));
            }
        }
    }
}
