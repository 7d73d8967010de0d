//! The serialization writer.
//!
//! Walks live values under the guidance of their type descriptors and
//! lowers them into opcodes, collecting every name, type, property,
//! resource key, async buffer and referenced object on the way. Strong
//! pointers queue their target for serialization; weak pointers only
//! record it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use membuf::{AsyncBufferRef, Buffer, CompressionType, ResidentUncompressedBuffer};
use rtti::{
    ClassDef, ObjectRef, PropertyDef, ResourceKey, ResourceRefValue, SimpleKind, StringId,
    StructValue, TypeDef, Value,
};
use tracing::warn;

use crate::error::SerialError;
use crate::stream::{InlineBufferSlot, OpcodeStream};

/// Insertion-ordered deduplicated set; the insertion index is the table
/// index the entry gets in the packed file.
pub struct OrderedSet<T> {
    items: Vec<T>,
    index: HashMap<T, u32>,
}

impl<T: Clone + Eq + Hash> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn insert(&mut self, item: T) -> u32 {
        if let Some(&existing) = self.index.get(&item) {
            return existing;
        }
        let position = self.items.len() as u32;
        self.items.push(item.clone());
        self.index.insert(item, position);
        position
    }

    pub fn get_index(&self, item: &T) -> Option<u32> {
        self.index.get(item).copied()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone + Eq + Hash> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

/// Identity of a serialized property: declaring class, name and the type
/// it had when written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub class: StringId,
    pub name: StringId,
    pub type_name: StringId,
}

/// Everything the writer collected across a save operation.
#[derive(Default)]
pub struct WriterReferences {
    pub string_ids: OrderedSet<StringId>,
    pub types: OrderedSet<StringId>,
    pub properties: OrderedSet<PropertyKey>,
    pub resources: OrderedSet<ResourceKey>,
    async_buffers: Vec<AsyncBufferRef>,
    async_buffer_index: HashMap<u64, u32>,
    /// Every object referenced anywhere, strong or weak, by instance id.
    pub objects: HashMap<u64, ObjectRef>,
}

impl WriterReferences {
    pub fn new() -> WriterReferences {
        WriterReferences::default()
    }

    pub fn async_buffers(&self) -> &[AsyncBufferRef] {
        &self.async_buffers
    }

    fn insert_async_buffer(&mut self, loader: AsyncBufferRef) {
        let crc = loader.crc();
        if !self.async_buffer_index.contains_key(&crc) {
            self.async_buffer_index
                .insert(crc, self.async_buffers.len() as u32);
            self.async_buffers.push(loader);
        }
    }
}

/// Opcode stream builder for a single object (or standalone value).
pub struct SerializationWriter<'a> {
    stream: &'a mut OpcodeStream,
    references: &'a mut WriterReferences,
    /// Strong targets discovered while writing; the saver drains these
    /// into its breadth-first queue.
    strong_refs: Vec<ObjectRef>,
    /// The object being written, for self-reference id lookups.
    current: Option<(u64, ObjectRef)>,
    inline_buffers: bool,
    buffer_compression: CompressionType,
    skip_depth: u32,
    errors: bool,
}

impl<'a> SerializationWriter<'a> {
    pub fn new(
        stream: &'a mut OpcodeStream,
        references: &'a mut WriterReferences,
        inline_buffers: bool,
        buffer_compression: CompressionType,
    ) -> SerializationWriter<'a> {
        SerializationWriter {
            stream,
            references,
            strong_refs: Vec::new(),
            current: None,
            inline_buffers,
            buffer_compression,
            skip_depth: 0,
            errors: false,
        }
    }

    pub fn set_current_object(&mut self, object: &ObjectRef) {
        let id = object.read().expect("object lock poisoned").id();
        self.current = Some((id, Arc::clone(object)));
    }

    /// Sticky failure state; set by opcode allocation failures.
    pub fn errors(&self) -> bool {
        self.errors || self.stream.out_of_memory()
    }

    pub fn take_strong_refs(&mut self) -> Vec<ObjectRef> {
        std::mem::take(&mut self.strong_refs)
    }

    fn failed(&mut self) {
        if !self.errors {
            warn!("serialization writer failed; output stream is incomplete");
            self.errors = true;
        }
    }

    fn check(&mut self, ok: bool) {
        if !ok {
            self.failed();
        }
    }

    pub fn begin_compound(&mut self, type_name: StringId) {
        let ok = self.stream.emit_compound(type_name);
        self.check(ok);
    }

    pub fn end_compound(&mut self) {
        let ok = self.stream.emit_compound_end();
        self.check(ok);
    }

    pub fn begin_skip_block(&mut self) {
        self.skip_depth += 1;
        let ok = self.stream.emit_skip_header();
        self.check(ok);
    }

    pub fn end_skip_block(&mut self) {
        if self.skip_depth == 0 {
            self.failed();
            return;
        }
        self.skip_depth -= 1;
        let ok = self.stream.emit_skip_label();
        self.check(ok);
    }

    pub fn write_string_id(&mut self, id: StringId) {
        if !id.is_empty() {
            self.references.string_ids.insert(id);
        }
        let ok = self.stream.emit_name(id);
        self.check(ok);
    }

    pub fn write_type(&mut self, type_name: StringId) {
        if !type_name.is_empty() {
            self.references.types.insert(type_name);
        }
        let ok = self.stream.emit_type_ref(type_name);
        self.check(ok);
    }

    pub fn write_property(&mut self, class: &Arc<ClassDef>, prop: &PropertyDef) {
        let key = PropertyKey {
            class: class.name,
            name: prop.name,
            type_name: prop.ty.name(),
        };
        self.references.types.insert(key.class);
        self.references.types.insert(key.type_name);
        self.references.string_ids.insert(key.name);
        self.references.properties.insert(key);

        let ok = self.stream.emit_property(key.class, key.name, key.type_name);
        self.check(ok);
    }

    pub fn write_pointer(&mut self, object: Option<&ObjectRef>, strong: bool) {
        match object {
            Some(object) => {
                let id = match &self.current {
                    Some((current_id, current)) if Arc::ptr_eq(current, object) => *current_id,
                    _ => object.read().expect("object lock poisoned").id(),
                };
                self.references.objects.insert(id, Arc::clone(object));
                if strong {
                    self.strong_refs.push(Arc::clone(object));
                }
                let ok = self.stream.emit_object_pointer(id, strong);
                self.check(ok);
            }
            None => {
                let ok = self.stream.emit_object_pointer(0, strong);
                self.check(ok);
            }
        }
    }

    pub fn write_resource_key(&mut self, key: Option<ResourceKey>) {
        match key {
            Some(key) if !key.id.is_nil() => {
                self.references.resources.insert(key);
                self.references.types.insert(key.class);
                let ok = self.stream.emit_resource_ref(*key.id.as_bytes(), key.class);
                self.check(ok);
            }
            _ => {
                let ok = self.stream.emit_resource_ref([0u8; 16], StringId::EMPTY);
                self.check(ok);
            }
        }
    }

    pub fn write_inlined_buffer(&mut self, buffer: Buffer) {
        if !self.inline_buffers && !buffer.is_empty() {
            // route through the buffer table so identical payloads dedupe
            let loader = ResidentUncompressedBuffer::new(buffer, self.buffer_compression);
            self.write_async_buffer(loader);
            return;
        }
        let ok = self.stream.emit_inline_buffer(InlineBufferSlot {
            data: Some(buffer),
            loader: None,
        });
        self.check(ok);
    }

    pub fn write_async_buffer(&mut self, loader: AsyncBufferRef) {
        self.references.insert_async_buffer(Arc::clone(&loader));
        let ok = self.stream.emit_inline_buffer(InlineBufferSlot {
            data: None,
            loader: Some(loader),
        });
        self.check(ok);
    }

    pub fn write_compressed_uint(&mut self, value: u32) {
        let ok = self.stream.emit_adaptive_number(value);
        self.check(ok);
    }

    pub fn write_data(&mut self, data: &[u8]) {
        let ok = self.stream.emit_data(data);
        self.check(ok);
    }
}

/// Writes one object's full payload: a compound of its non-default
/// properties, each framed by a skip block.
pub fn write_object_payload(
    writer: &mut SerializationWriter<'_>,
    object: &ObjectRef,
) -> Result<(), SerialError> {
    writer.set_current_object(object);
    let guard = object.read().expect("object lock poisoned");
    let class = Arc::clone(guard.class());
    write_compound(writer, &class, guard.values())?;
    if writer.errors() {
        return Err(SerialError::WriterFailed);
    }
    Ok(())
}

fn write_compound(
    writer: &mut SerializationWriter<'_>,
    class: &Arc<ClassDef>,
    values: &[Value],
) -> Result<(), SerialError> {
    writer.begin_compound(class.name);
    for (prop, value) in class.properties().iter().zip(values.iter()) {
        if prop.transient {
            continue;
        }
        // default-value suppression: untouched properties stay off the wire
        if *value == prop.default_value() {
            continue;
        }
        writer.write_property(class, prop);
        writer.begin_skip_block();
        write_value(writer, &prop.ty, value)?;
        writer.end_skip_block();
    }
    writer.end_compound();
    Ok(())
}

/// Recursively lowers `value` into opcodes, dispatching on its type.
pub fn write_value(
    writer: &mut SerializationWriter<'_>,
    ty: &TypeDef,
    value: &Value,
) -> Result<(), SerialError> {
    if !ty.accepts(value) {
        return Err(SerialError::MalformedPayload(format!(
            "value of kind '{}' cannot be written as '{}'",
            value.kind_name(),
            ty.name()
        )));
    }

    match (ty, value) {
        (TypeDef::Simple(kind), value) => write_simple(writer, *kind, value),
        (TypeDef::Enum(def), Value::Enum(raw)) => {
            let name = match def.find_name(*raw) {
                Some(name) => name,
                None => {
                    // an empty name tells the reader the value was lost
                    warn!(value = raw, enum_name = %def.name, "missing option name, value will be lost");
                    StringId::EMPTY
                }
            };
            writer.write_string_id(name);
        }
        (TypeDef::Bitfield(def), Value::Bitfield(bits)) => {
            for bit in 0..64u8 {
                if bits & (1u64 << bit) == 0 {
                    continue;
                }
                match def.flag_name(bit) {
                    Some(name) => writer.write_string_id(name),
                    None => {
                        warn!(bit, bitfield = %def.name, "missing flag name, bit will be lost")
                    }
                }
            }
            writer.write_string_id(StringId::EMPTY);
        }
        (TypeDef::Array { element, .. }, Value::Array(items)) => {
            writer.write_compressed_uint(items.len() as u32);
            for item in items {
                write_value(writer, element, item)?;
            }
        }
        (TypeDef::Class(_), Value::Struct(StructValue { class, fields })) => {
            write_compound(writer, class, fields)?;
        }
        (TypeDef::ClassRef, Value::ClassRef(name)) => {
            writer.write_type(name.unwrap_or(StringId::EMPTY));
        }
        (TypeDef::StrongHandle(_), Value::Object(target)) => {
            writer.write_pointer(target.as_ref(), true);
        }
        (TypeDef::WeakHandle(_), Value::Weak(target)) => {
            writer.write_pointer(target.upgrade().as_ref(), false);
        }
        (TypeDef::ResourceRef(_), Value::Resource(resource)) => {
            write_resource(writer, resource)?;
        }
        (TypeDef::Buffer, Value::Buffer(buffer)) => {
            writer.write_inlined_buffer(buffer.clone());
        }
        (TypeDef::AsyncBuffer, Value::AsyncBuffer(loader)) => match loader {
            Some(loader) => writer.write_async_buffer(Arc::clone(loader)),
            None => writer.write_inlined_buffer(Buffer::new()),
        },
        (TypeDef::Variant, Value::Variant(inner)) => match inner {
            None => writer.write_data(&[0]),
            Some(boxed) => {
                let (inner_ty, inner_value) = boxed.as_ref();
                writer.write_data(&[1]);
                writer.write_type(inner_ty.name());
                writer.begin_skip_block();
                write_value(writer, inner_ty, inner_value)?;
                writer.end_skip_block();
            }
        },
        (TypeDef::Custom(def), Value::Custom(_, stored)) => {
            let bytes = (def.write_binary)(stored);
            writer.write_compressed_uint(bytes.len() as u32);
            writer.write_data(&bytes);
        }
        _ => unreachable!("accepts() filtered mismatched pairs"),
    }
    Ok(())
}

const RESOURCE_REF_EXTERNAL: u8 = 1;
const RESOURCE_REF_INLINED: u8 = 2;

fn write_resource(
    writer: &mut SerializationWriter<'_>,
    resource: &ResourceRefValue,
) -> Result<(), SerialError> {
    match resource {
        ResourceRefValue::None => {
            writer.write_data(&[0]);
        }
        ResourceRefValue::External { key, .. } => {
            writer.write_data(&[RESOURCE_REF_EXTERNAL]);
            writer.write_resource_key(Some(*key));
        }
        ResourceRefValue::Inlined(object) => {
            writer.write_data(&[RESOURCE_REF_INLINED]);
            writer.write_pointer(Some(object), true);
        }
    }
    Ok(())
}

fn write_simple(writer: &mut SerializationWriter<'_>, kind: SimpleKind, value: &Value) {
    match (kind, value) {
        (SimpleKind::Bool, Value::Bool(v)) => writer.write_data(&[*v as u8]),
        (SimpleKind::I8, Value::I8(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::I16, Value::I16(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::I32, Value::I32(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::I64, Value::I64(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::U8, Value::U8(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::U16, Value::U16(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::U32, Value::U32(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::U64, Value::U64(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::F32, Value::F32(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::F64, Value::F64(v)) => writer.write_data(&v.to_le_bytes()),
        (SimpleKind::String, Value::Str(v)) => {
            writer.write_compressed_uint(v.len() as u32);
            writer.write_data(v.as_bytes());
        }
        _ => unreachable!("accepts() filtered mismatched pairs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Op, PagePool};

    #[test]
    fn test_ordered_set_assigns_first_seen_indices() {
        let mut set = OrderedSet::new();
        assert_eq!(set.insert("b"), 0);
        assert_eq!(set.insert("a"), 1);
        assert_eq!(set.insert("b"), 0);
        assert_eq!(set.items(), ["b", "a"]);
    }

    #[test]
    fn test_writer_collects_references() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        let mut refs = WriterReferences::new();
        {
            let mut writer = SerializationWriter::new(&mut stream, &mut refs, false, CompressionType::Lz4);
            writer.write_string_id(StringId::intern("alpha"));
            writer.write_string_id(StringId::intern("beta"));
            writer.write_string_id(StringId::intern("alpha"));
            writer.write_type(StringId::intern("f32"));
            assert!(!writer.errors());
        }
        assert_eq!(refs.string_ids.len(), 2);
        assert_eq!(refs.types.len(), 1);
    }

    #[test]
    fn test_empty_names_are_not_collected() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        let mut refs = WriterReferences::new();
        {
            let mut writer = SerializationWriter::new(&mut stream, &mut refs, false, CompressionType::Lz4);
            writer.write_string_id(StringId::EMPTY);
        }
        assert!(refs.string_ids.is_empty());
    }

    #[test]
    fn test_unbalanced_skip_block_fails() {
        let mut stream = OpcodeStream::new(PagePool::new(None));
        let mut refs = WriterReferences::new();
        let mut writer = SerializationWriter::new(&mut stream, &mut refs, false, CompressionType::Lz4);
        writer.end_skip_block();
        assert!(writer.errors());
    }

    #[test]
    fn test_oom_propagates_to_writer() {
        let mut stream = OpcodeStream::new(PagePool::with_page_size(32, Some(32)));
        let mut refs = WriterReferences::new();
        let mut writer = SerializationWriter::new(&mut stream, &mut refs, false, CompressionType::Lz4);
        for _ in 0..100 {
            writer.write_compressed_uint(7);
        }
        assert!(writer.errors());
    }

    #[test]
    fn test_default_suppression() {
        use rtti::{ClassDef, Object, PropertyDef};

        let cls = ClassDef::build("test.WriterSuppression")
            .prop(PropertyDef::new("x", TypeDef::Simple(SimpleKind::F32)))
            .prop(PropertyDef::new("y", TypeDef::Simple(SimpleKind::F32)))
            .finish();
        let obj = Object::create(&cls).unwrap();
        obj.write().unwrap().set("y", Value::F32(2.0)).unwrap();

        let mut stream = OpcodeStream::new(PagePool::new(None));
        let mut refs = WriterReferences::new();
        let mut writer = SerializationWriter::new(&mut stream, &mut refs, false, CompressionType::Lz4);
        write_object_payload(&mut writer, &obj).unwrap();

        // only 'y' made it to the stream
        let properties: Vec<String> = stream
            .ops()
            .filter_map(|op| match op {
                Op::Property { name, .. } => Some(name.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(properties, ["y"]);
    }
}
