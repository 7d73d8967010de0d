//! XML rendering of the text vocabulary, and the matching reader.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use membuf::{Buffer, CompressionType, ResidentUncompressedBuffer};
use rtti::{
    ClassDef, Object, ObjectRef, ObjectWeak, ResourceId, ResourceKey, ResourcePromise,
    ResourcePromiseRef, ResourceRefValue, SimpleKind, StringId, StructValue, TypeDef,
    TypeRegistry, Value,
};
use tracing::warn;

use crate::context::ObjectLoadingContext;
use crate::error::ErrorReporter;
use crate::text::dom::XmlNode;
use crate::text::mapper::TextObjectMap;
use crate::text::writer::{object_class_name, write_object_body, TextValueWriter};

/// Builds the XML tree for one save operation. Runs after the mapping
/// pass; `map` tells it which objects need ids.
pub struct XmlTextWriter<'m> {
    map: &'m TextObjectMap,
    stack: Vec<XmlNode>,
    defined: HashSet<u64>,
}

impl<'m> XmlTextWriter<'m> {
    pub fn new(map: &'m TextObjectMap, root_name: &str) -> XmlTextWriter<'m> {
        XmlTextWriter {
            map,
            stack: vec![XmlNode::new(root_name)],
            defined: HashSet::new(),
        }
    }

    pub fn finish(mut self) -> XmlNode {
        debug_assert_eq!(self.stack.len(), 1, "unbalanced element nesting");
        self.stack.pop().expect("writer always has a root")
    }

    fn current(&mut self) -> &mut XmlNode {
        self.stack.last_mut().expect("writer always has a node")
    }

    fn pop_into_parent(&mut self) {
        let node = self.stack.pop().expect("writer always has a node");
        self.current().children.push(node);
    }
}

impl TextValueWriter for XmlTextWriter<'_> {
    fn begin_array_element(&mut self) {
        self.stack.push(XmlNode::new("element"));
    }

    fn end_array_element(&mut self) {
        self.pop_into_parent();
    }

    fn begin_struct_element(&mut self, name: &str) {
        self.stack.push(XmlNode::new(name));
    }

    fn end_struct_element(&mut self) {
        self.pop_into_parent();
    }

    fn write_value_text(&mut self, text: &str) {
        self.current().text = text.to_string();
    }

    fn write_value_bytes(&mut self, data: &[u8]) {
        self.current().text = BASE64_STANDARD.encode(data);
    }

    fn write_value_object(&mut self, object: Option<&ObjectRef>, strong: bool) {
        let Some(object) = object else {
            self.current().text = "null".to_string();
            return;
        };
        let id = object.read().expect("object lock poisoned").id();
        let Some(info) = self.map.info(id) else {
            warn!("object was not seen by the mapping pass");
            self.current().text = "null".to_string();
            return;
        };

        // only the first strong appearance defines the object
        if strong && self.defined.insert(id) {
            let class = object_class_name(object);
            self.current().set_attr("class", class.as_str());
            if let Some(index) = info.index {
                let index = index.to_string();
                self.current().set_attr("id", &index);
            }
            if let Err(error) = write_object_body(self, object) {
                warn!(%error, "object body failed to render");
            }
        } else if info.strong_refs > 0 {
            match info.index {
                Some(index) => {
                    let index = index.to_string();
                    self.current().set_attr("refId", &index);
                }
                None => {
                    warn!("shared object without an assigned id");
                    self.current().text = "null".to_string();
                }
            }
        } else {
            // weak-only targets are not serialized; the reference is lost
            self.current().text = "null".to_string();
        }
    }

    fn write_value_resource(&mut self, resource: &ResourceRefValue) {
        match resource {
            ResourceRefValue::None => self.current().text = "null".to_string(),
            ResourceRefValue::Inlined(object) => self.write_value_object(Some(object), true),
            ResourceRefValue::External { key, .. } => {
                let class = key.class.as_str().to_string();
                let guid = key.id.to_string();
                self.current().set_attr("class", &class);
                self.current().set_attr("guid", &guid);
            }
        }
    }
}

/// Decodes an XML tree back into typed values and objects.
pub struct XmlTextReader {
    registry: Arc<TypeRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    context_path: String,
    collect_promises: bool,
    promise_cache: HashMap<ResourceKey, ResourcePromiseRef>,
    defined: HashMap<u32, ObjectRef>,
    parents: Vec<ObjectRef>,
    /// Collected promises, in creation order.
    pub promises: Vec<ResourcePromiseRef>,
    /// Every object created, in creation order; post-load runs over this.
    pub created: Vec<ObjectRef>,
}

impl XmlTextReader {
    pub fn new(ctx: &ObjectLoadingContext) -> XmlTextReader {
        XmlTextReader {
            registry: Arc::clone(&ctx.registry),
            reporter: Arc::clone(&ctx.reporter),
            context_path: ctx.context_path.clone(),
            collect_promises: ctx.collect_promises,
            promise_cache: HashMap::new(),
            defined: HashMap::new(),
            parents: Vec::new(),
            promises: Vec::new(),
            created: Vec::new(),
        }
    }

    fn report(&self, node: &XmlNode, message: &str) {
        self.reporter
            .report_text_error(&self.context_path, node.line, message);
    }

    /// Reads a value of `ty` out of `node`; problems degrade to defaults
    /// and are reported with the node's line.
    pub fn read_value(&mut self, node: &XmlNode, ty: &TypeDef) -> Value {
        match ty {
            TypeDef::Simple(kind) => self.read_simple(node, *kind),
            TypeDef::Enum(def) => {
                let text = node.text.trim();
                if text.is_empty() {
                    return Value::Enum(def.default_value());
                }
                if let Some(name) = StringId::find(text) {
                    if let Some(value) = def.find_value(name) {
                        return Value::Enum(value);
                    }
                }
                // numeric fallback keeps values from retired options
                if let Ok(number) = text.parse::<i64>() {
                    return Value::Enum(number);
                }
                self.reporter.report_enum_option_missing(
                    &self.context_path,
                    def.name,
                    StringId::intern(text),
                );
                Value::Enum(def.default_value())
            }
            TypeDef::Bitfield(def) => {
                let mut bits = 0u64;
                for part in node.text.split(';') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    if let Some(bit) = StringId::find(part).and_then(|name| def.find_flag(name)) {
                        bits |= 1u64 << bit;
                    } else if let Ok(bit) = part.parse::<u8>() {
                        // numeric fallback by bit index
                        if bit < 64 {
                            bits |= 1u64 << bit;
                        }
                    } else {
                        self.reporter.report_bitfield_flag_missing(
                            &self.context_path,
                            def.name,
                            StringId::intern(part),
                        );
                    }
                }
                Value::Bitfield(bits)
            }
            TypeDef::Array { element, capacity } => {
                let count = node.children.len() as u32;
                let keep = match capacity {
                    Some(capacity) if count > *capacity => {
                        self.reporter
                            .report_array_overflow(&self.context_path, count, *capacity);
                        *capacity
                    }
                    _ => count,
                };
                let items = node
                    .children
                    .iter()
                    .take(keep as usize)
                    .map(|child| self.read_value(child, element))
                    .collect();
                Value::Array(items)
            }
            TypeDef::Class(def) => {
                let mut value = StructValue::of(def);
                self.read_struct_fields(node, def, &mut value.fields);
                Value::Struct(value)
            }
            TypeDef::ClassRef => {
                let text = node.text.trim();
                if text.is_empty() || text == "null" {
                    return Value::ClassRef(None);
                }
                let name = StringId::intern(text);
                if self.registry.find_class(name).is_none() {
                    self.reporter.report_type_missing(&self.context_path, name);
                    return Value::ClassRef(None);
                }
                Value::ClassRef(Some(name))
            }
            TypeDef::StrongHandle(class) => {
                Value::Object(self.read_object_checked(node, *class))
            }
            TypeDef::WeakHandle(class) => {
                Value::Weak(match self.read_object_checked(node, *class) {
                    Some(object) => ObjectWeak::from_ref(&object),
                    None => ObjectWeak::new(),
                })
            }
            TypeDef::ResourceRef(class) => Value::Resource(self.read_resource(node, *class)),
            TypeDef::Buffer => Value::Buffer(self.read_bytes(node)),
            TypeDef::AsyncBuffer => {
                let data = self.read_bytes(node);
                if data.is_empty() {
                    Value::AsyncBuffer(None)
                } else {
                    Value::AsyncBuffer(Some(ResidentUncompressedBuffer::new(
                        data,
                        CompressionType::Lz4,
                    )))
                }
            }
            TypeDef::Variant => {
                if node.text.trim() == "null" || node.children.is_empty() {
                    return Value::Variant(None);
                }
                let type_node = node.children.iter().find(|c| c.name == "type");
                let value_node = node.children.iter().find(|c| c.name == "value");
                let (Some(type_node), Some(value_node)) = (type_node, value_node) else {
                    self.report(node, "incomplete variant value");
                    return Value::Variant(None);
                };
                let type_name = StringId::intern(type_node.text.trim());
                let Some(inner_ty) = self.registry.find_type(type_name) else {
                    self.reporter
                        .report_type_missing(&self.context_path, type_name);
                    return Value::Variant(None);
                };
                let inner_value = self.read_value(value_node, &inner_ty);
                Value::variant(inner_ty, inner_value)
            }
            TypeDef::Custom(def) => match (def.read_text)(node.text.trim()) {
                Some(stored) => Value::Custom(Arc::clone(def), stored),
                None => {
                    self.report(node, &format!("invalid '{}' value", def.name));
                    Value::Custom(Arc::clone(def), (def.make_default)())
                }
            },
        }
    }

    fn read_simple(&mut self, node: &XmlNode, kind: SimpleKind) -> Value {
        let text = node.text.trim();
        macro_rules! parse_number {
            ($variant:ident, $ty:ty) => {
                match text.parse::<$ty>() {
                    Ok(value) => Value::$variant(value),
                    Err(_) => {
                        self.report(node, &format!("invalid number '{text}'"));
                        Value::$variant(Default::default())
                    }
                }
            };
        }
        match kind {
            SimpleKind::Bool => match text {
                "true" | "1" => Value::Bool(true),
                "false" | "0" | "" => Value::Bool(false),
                other => {
                    self.report(node, &format!("invalid boolean '{other}'"));
                    Value::Bool(false)
                }
            },
            SimpleKind::I8 => parse_number!(I8, i8),
            SimpleKind::I16 => parse_number!(I16, i16),
            SimpleKind::I32 => parse_number!(I32, i32),
            SimpleKind::I64 => parse_number!(I64, i64),
            SimpleKind::U8 => parse_number!(U8, u8),
            SimpleKind::U16 => parse_number!(U16, u16),
            SimpleKind::U32 => parse_number!(U32, u32),
            SimpleKind::U64 => parse_number!(U64, u64),
            SimpleKind::F32 => parse_number!(F32, f32),
            SimpleKind::F64 => parse_number!(F64, f64),
            SimpleKind::String => Value::Str(node.text.clone()),
        }
    }

    fn read_bytes(&mut self, node: &XmlNode) -> Buffer {
        let text = node.text.trim();
        if text.is_empty() {
            return Buffer::new();
        }
        let cleaned: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        match BASE64_STANDARD.decode(cleaned.as_bytes()) {
            Ok(data) => Buffer::from_vec(data),
            Err(error) => {
                self.report(node, &format!("invalid Base64 payload: {error}"));
                Buffer::new()
            }
        }
    }

    fn read_struct_fields(&mut self, node: &XmlNode, class: &Arc<ClassDef>, fields: &mut [Value]) {
        for child in &node.children {
            let name = StringId::intern(&child.name);
            match class.find_property(name) {
                Some((slot, prop)) => {
                    let ty = prop.ty.clone();
                    fields[slot] = self.read_value(child, &ty);
                }
                None => {
                    self.reporter
                        .report_property_missing(&self.context_path, class.name, name);
                }
            }
        }
    }

    fn read_object_checked(&mut self, node: &XmlNode, class: StringId) -> Option<ObjectRef> {
        let object = self.read_object(node)?;
        let compatible = object
            .read()
            .expect("object lock poisoned")
            .class()
            .is_a(class);
        if !compatible {
            self.report(node, "object has an incompatible class for this slot");
            return None;
        }
        Some(object)
    }

    /// Decodes an object-position node: `null`, a `refId` back-reference,
    /// or a `class` definition with an optional `id`.
    pub fn read_object(&mut self, node: &XmlNode) -> Option<ObjectRef> {
        if node.text.trim() == "null" {
            return None;
        }

        if let Some(text) = node.attr("refId") {
            let Ok(id) = text.parse::<u32>() else {
                self.report(node, &format!("invalid reference id '{text}'"));
                return None;
            };
            let Some(object) = self.defined.get(&id) else {
                self.report(node, &format!("object reference id {id} is not defined"));
                return None;
            };
            return Some(Arc::clone(object));
        }

        if let Some(text) = node.attr("class") {
            let class_name = StringId::intern(text);
            let Some(class) = self.registry.find_class(class_name) else {
                self.reporter
                    .report_type_missing(&self.context_path, class_name);
                return None;
            };
            if class.is_abstract {
                self.reporter
                    .report_class_not_creatable(&self.context_path, class_name);
                return None;
            }
            let Ok(object) = Object::create(&class) else {
                self.reporter
                    .report_class_not_creatable(&self.context_path, class_name);
                return None;
            };

            if let Some(id_text) = node.attr("id") {
                match id_text.parse::<u32>() {
                    Ok(id) if self.defined.contains_key(&id) => {
                        self.report(node, &format!("object id {id} was already defined"));
                    }
                    Ok(id) => {
                        self.defined.insert(id, Arc::clone(&object));
                    }
                    Err(_) => {
                        self.report(node, &format!("invalid object id '{id_text}'"));
                    }
                }
            }

            if let Some(parent) = self.parents.last() {
                object
                    .write()
                    .expect("object lock poisoned")
                    .set_parent(parent);
            }
            self.created.push(Arc::clone(&object));

            self.parents.push(Arc::clone(&object));
            self.read_object_body(node, &object);
            self.parents.pop();

            return Some(object);
        }

        self.report(node, "incomplete object definition");
        None
    }

    fn read_object_body(&mut self, node: &XmlNode, object: &ObjectRef) {
        let class = {
            let guard = object.read().expect("object lock poisoned");
            Arc::clone(guard.class())
        };
        for child in &node.children {
            let name = StringId::intern(&child.name);
            match class.find_property(name) {
                Some((slot, prop)) => {
                    let ty = prop.ty.clone();
                    let value = self.read_value(child, &ty);
                    object
                        .write()
                        .expect("object lock poisoned")
                        .set_value_at(slot, value);
                }
                None => {
                    self.reporter
                        .report_property_missing(&self.context_path, class.name, name);
                }
            }
        }
    }

    fn read_resource(&mut self, node: &XmlNode, constraint: StringId) -> ResourceRefValue {
        if node.text.trim() == "null" {
            return ResourceRefValue::None;
        }

        let Some(class_text) = node.attr("class") else {
            self.report(node, "incomplete resource definition");
            return ResourceRefValue::None;
        };
        let class_name = StringId::intern(class_text);
        let Some(class) = self.registry.find_class(class_name) else {
            self.reporter
                .report_resource_class_missing(&self.context_path, class_name);
            return ResourceRefValue::None;
        };
        if !class.is_resource || !class.is_a(constraint) {
            self.report(node, &format!("class '{class_name}' is not a valid resource here"));
            return ResourceRefValue::None;
        }

        if let Some(guid_text) = node.attr("guid") {
            let Some(id) = ResourceId::parse(guid_text) else {
                self.reporter
                    .report_guid_parse_failure(&self.context_path, guid_text);
                return ResourceRefValue::None;
            };
            let key = ResourceKey::new(id, class_name);
            let promise = self.resource_promise(key);
            return ResourceRefValue::External {
                key,
                promise: Some(promise),
            };
        }

        // a class without a guid is an inlined resource object
        match self.read_object_checked(node, constraint) {
            Some(object) => ResourceRefValue::Inlined(object),
            None => ResourceRefValue::None,
        }
    }

    fn resource_promise(&mut self, key: ResourceKey) -> ResourcePromiseRef {
        if let Some(promise) = self.promise_cache.get(&key) {
            return Arc::clone(promise);
        }
        let promise = if self.context_path.is_empty() {
            ResourcePromise::empty(key)
        } else {
            ResourcePromise::with_path(key, &self.context_path)
        };
        if self.collect_promises {
            self.promises.push(Arc::clone(&promise));
        } else {
            // nobody will ever resolve it
            promise.fulfill(None);
        }
        self.promise_cache.insert(key, Arc::clone(&promise));
        promise
    }
}
