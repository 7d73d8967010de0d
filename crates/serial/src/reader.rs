//! The serialization reader.
//!
//! A bounds-checked cursor over one export's packed payload. Every
//! reference decodes as an adaptive-encoded table index resolved through
//! [`ResolvedReferences`]; unknown types and properties are consumed
//! through skip frames so one stale value never corrupts its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use membuf::{AsyncBufferRef, Buffer, ResidentUncompressedBuffer};
use rtti::{
    ClassDef, ObjectRef, ObjectWeak, ResourceKey, ResourcePromiseRef, ResourceRefValue,
    SimpleKind, StringId, StructValue, TypeDef, TypeRegistry, Value,
};
use tracing::warn;

use crate::adaptive::read_adaptive;
use crate::error::{ErrorReporter, SerialError};
use crate::packer::{BUFFER_MODE_INLINE, BUFFER_MODE_NULL, BUFFER_MODE_TABLE};

/// One resolved property-table row.
pub struct ResolvedProperty {
    pub declaring_class: StringId,
    pub name: StringId,
    pub type_name: StringId,
    /// Present when the recorded type still resolves.
    pub ty: Option<TypeDef>,
}

/// One resolved import-table row.
pub struct ResolvedImport {
    pub key: ResourceKey,
    pub promise: Option<ResourcePromiseRef>,
}

/// Everything the loader resolved out of the file tables before any
/// payload is read.
#[derive(Default)]
pub struct ResolvedReferences {
    pub names: Vec<StringId>,
    pub type_names: Vec<StringId>,
    pub types: Vec<Option<TypeDef>>,
    pub properties: Vec<ResolvedProperty>,
    pub objects: Vec<Option<ObjectRef>>,
    pub imports: Vec<ResolvedImport>,
    pub buffers: HashMap<u64, AsyncBufferRef>,
}

/// An entered skip frame; `leave_skip_block` clamps the cursor to its end.
#[derive(Debug)]
pub struct SkipBlock {
    end: usize,
}

pub struct SerializationReader<'a> {
    data: &'a [u8],
    pos: usize,
    version: u32,
    refs: &'a ResolvedReferences,
    registry: Arc<TypeRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    context: String,
    /// Object whose payload is being read; strong children get it as their
    /// parent.
    current_parent: Option<ObjectRef>,
}

impl<'a> SerializationReader<'a> {
    pub fn new(
        data: &'a [u8],
        version: u32,
        refs: &'a ResolvedReferences,
        registry: &Arc<TypeRegistry>,
        reporter: &Arc<dyn ErrorReporter>,
        context: &str,
    ) -> SerializationReader<'a> {
        SerializationReader {
            data,
            pos: 0,
            version,
            refs,
            registry: Arc::clone(registry),
            reporter: Arc::clone(reporter),
            context: context.to_string(),
            current_parent: None,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn set_current_parent(&mut self, parent: Option<ObjectRef>) {
        self.current_parent = parent;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, size: usize) -> Result<&'a [u8], SerialError> {
        if self.pos + size > self.data.len() {
            return Err(SerialError::PayloadUnderrun {
                need: size as u64,
                have: self.remaining() as u64,
            });
        }
        let bytes = &self.data[self.pos..self.pos + size];
        self.pos += size;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerialError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_compressed_number(&mut self) -> Result<u64, SerialError> {
        read_adaptive(self.data, &mut self.pos)
    }

    pub fn read_string_id(&mut self) -> Result<StringId, SerialError> {
        let index = self.read_compressed_number()? as usize;
        self.refs
            .names
            .get(index)
            .copied()
            .ok_or(SerialError::BadReference {
                what: "names",
                index: index as u64,
                len: self.refs.names.len(),
            })
    }

    /// Returns the recorded type name and, when it still resolves, the
    /// type.
    pub fn read_type(&mut self) -> Result<(StringId, Option<TypeDef>), SerialError> {
        let index = self.read_compressed_number()? as usize;
        if index >= self.refs.type_names.len() {
            return Err(SerialError::BadReference {
                what: "types",
                index: index as u64,
                len: self.refs.type_names.len(),
            });
        }
        Ok((self.refs.type_names[index], self.refs.types[index].clone()))
    }

    pub fn read_pointer(&mut self, strong: bool) -> Result<Option<ObjectRef>, SerialError> {
        let index = self.read_compressed_number()? as usize;
        if index == 0 {
            return Ok(None);
        }
        let object = self
            .refs
            .objects
            .get(index - 1)
            .ok_or(SerialError::BadReference {
                what: "exports",
                index: index as u64,
                len: self.refs.objects.len(),
            })?
            .clone();

        if strong {
            if let (Some(child), Some(parent)) = (&object, &self.current_parent) {
                if !Arc::ptr_eq(child, parent) {
                    child
                        .write()
                        .expect("object lock poisoned")
                        .set_parent(parent);
                }
            }
        }
        Ok(object)
    }

    pub fn read_resource(&mut self) -> Result<Option<&'a ResolvedImport>, SerialError> {
        let index = self.read_compressed_number()? as usize;
        if index == 0 {
            return Ok(None);
        }
        self.refs
            .imports
            .get(index - 1)
            .map(Some)
            .ok_or(SerialError::BadReference {
                what: "imports",
                index: index as u64,
                len: self.refs.imports.len(),
            })
    }

    fn buffer_loader(&self, crc: u64) -> Result<AsyncBufferRef, SerialError> {
        self.refs
            .buffers
            .get(&crc)
            .cloned()
            .ok_or(SerialError::MissingBuffer { crc })
    }

    /// Reads a buffer value, resolving table references through the
    /// loaders and decompressing on the spot.
    pub fn read_inlined_buffer(&mut self) -> Result<Buffer, SerialError> {
        match self.read_u8()? {
            BUFFER_MODE_NULL => Ok(Buffer::new()),
            BUFFER_MODE_INLINE => {
                let size = self.read_compressed_number()? as usize;
                Ok(Buffer::from_slice(self.read_bytes(size)?))
            }
            BUFFER_MODE_TABLE => {
                let crc = u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap());
                Ok(self.buffer_loader(crc)?.load()?)
            }
            other => Err(SerialError::MalformedPayload(format!(
                "unknown buffer mode {other}"
            ))),
        }
    }

    /// Reads a buffer value as a deferred loader.
    pub fn read_async_buffer(&mut self) -> Result<Option<AsyncBufferRef>, SerialError> {
        match self.read_u8()? {
            BUFFER_MODE_NULL => Ok(None),
            BUFFER_MODE_INLINE => {
                let size = self.read_compressed_number()? as usize;
                let data = Buffer::from_slice(self.read_bytes(size)?);
                Ok(Some(ResidentUncompressedBuffer::new(
                    data,
                    membuf::CompressionType::Lz4,
                )))
            }
            BUFFER_MODE_TABLE => {
                let crc = u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap());
                Ok(Some(self.buffer_loader(crc)?))
            }
            other => Err(SerialError::MalformedPayload(format!(
                "unknown buffer mode {other}"
            ))),
        }
    }

    /// Reads the pre-packed distance and returns the frame; pair with
    /// `leave_skip_block`.
    pub fn enter_skip_block(&mut self) -> Result<SkipBlock, SerialError> {
        let width = self.read_u8()?;
        let distance = match width {
            1 => u64::from(self.read_u8()?),
            2 => u64::from(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap())),
            4 => u64::from(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap())),
            other => {
                return Err(SerialError::MalformedPayload(format!(
                    "invalid skip frame width {other}"
                )))
            }
        };
        let end = self.pos + distance as usize;
        if end > self.data.len() {
            return Err(SerialError::PayloadUnderrun {
                need: distance,
                have: self.remaining() as u64,
            });
        }
        Ok(SkipBlock { end })
    }

    /// Clamps the cursor to the frame end, whatever happened inside.
    pub fn leave_skip_block(&mut self, block: SkipBlock) {
        if self.pos != block.end {
            warn!(
                pos = self.pos,
                end = block.end,
                "skip frame not fully consumed, clamping"
            );
        }
        self.pos = block.end;
    }
}

/// Reads a value of type `ty` from the payload.
pub fn read_value(
    reader: &mut SerializationReader<'_>,
    ty: &TypeDef,
) -> Result<Value, SerialError> {
    match ty {
        TypeDef::Simple(kind) => read_simple(reader, *kind),
        TypeDef::Enum(def) => {
            let name = reader.read_string_id()?;
            if name.is_empty() {
                // writer lost the option name; keep the default
                return Ok(Value::Enum(def.default_value()));
            }
            match def.find_value(name) {
                Some(value) => Ok(Value::Enum(value)),
                None => {
                    reader.reporter.report_enum_option_missing(
                        &reader.context,
                        def.name,
                        name,
                    );
                    Ok(Value::Enum(def.default_value()))
                }
            }
        }
        TypeDef::Bitfield(def) => {
            let mut bits = 0u64;
            loop {
                let name = reader.read_string_id()?;
                if name.is_empty() {
                    break;
                }
                match def.find_flag(name) {
                    Some(bit) => bits |= 1u64 << bit,
                    None => reader.reporter.report_bitfield_flag_missing(
                        &reader.context,
                        def.name,
                        name,
                    ),
                }
            }
            Ok(Value::Bitfield(bits))
        }
        TypeDef::Array { element, capacity } => {
            let count = reader.read_compressed_number()? as u32;
            if let Some(capacity) = capacity {
                if count > *capacity {
                    reader
                        .reporter
                        .report_array_overflow(&reader.context, count, *capacity);
                }
            }
            let keep = capacity.map_or(count, |cap| count.min(cap));
            let mut items = Vec::with_capacity(keep as usize);
            for index in 0..count {
                // elements past a fixed capacity still consume their bytes
                let value = read_value(reader, element)?;
                if index < keep {
                    items.push(value);
                }
            }
            Ok(Value::Array(items))
        }
        TypeDef::Class(def) => {
            let mut value = StructValue::of(def);
            read_compound_fields(reader, def, &mut value.fields)?;
            Ok(Value::Struct(value))
        }
        TypeDef::ClassRef => {
            let (name, _) = reader.read_type()?;
            if name.is_empty() {
                return Ok(Value::ClassRef(None));
            }
            if reader.registry.find_class(name).is_none() {
                reader.reporter.report_type_missing(&reader.context, name);
                return Ok(Value::ClassRef(None));
            }
            Ok(Value::ClassRef(Some(name)))
        }
        TypeDef::StrongHandle(class) => {
            let object = reader.read_pointer(true)?;
            Ok(Value::Object(check_handle_class(object, *class)))
        }
        TypeDef::WeakHandle(class) => {
            let object = reader.read_pointer(false)?;
            let object = check_handle_class(object, *class);
            Ok(Value::Weak(match object {
                Some(object) => ObjectWeak::from_ref(&object),
                None => ObjectWeak::new(),
            }))
        }
        TypeDef::ResourceRef(class) => read_resource_ref(reader, *class),
        TypeDef::Buffer => Ok(Value::Buffer(reader.read_inlined_buffer()?)),
        TypeDef::AsyncBuffer => Ok(Value::AsyncBuffer(reader.read_async_buffer()?)),
        TypeDef::Variant => {
            if reader.read_u8()? == 0 {
                return Ok(Value::Variant(None));
            }
            let (type_name, inner_ty) = reader.read_type()?;
            let block = reader.enter_skip_block()?;
            let result = match &inner_ty {
                Some(inner_ty) => match read_value(reader, inner_ty) {
                    Ok(value) => Value::variant(inner_ty.clone(), value),
                    Err(error) => {
                        warn!(%error, "variant payload unreadable, dropping value");
                        Value::Variant(None)
                    }
                },
                None => {
                    reader
                        .reporter
                        .report_type_missing(&reader.context, type_name);
                    Value::Variant(None)
                }
            };
            reader.leave_skip_block(block);
            Ok(result)
        }
        TypeDef::Custom(def) => {
            let size = reader.read_compressed_number()? as usize;
            let bytes = reader.read_bytes(size)?;
            match (def.read_binary)(bytes) {
                Some(stored) => Ok(Value::Custom(Arc::clone(def), stored)),
                None => {
                    warn!(custom = %def.name, "custom type rejected its payload");
                    Ok(Value::Custom(Arc::clone(def), (def.make_default)()))
                }
            }
        }
    }
}

fn check_handle_class(object: Option<ObjectRef>, class: StringId) -> Option<ObjectRef> {
    let object = object?;
    let matches = object
        .read()
        .expect("object lock poisoned")
        .class()
        .is_a(class);
    if !matches {
        warn!(expected = %class, "pointer target has incompatible class, dropping");
        return None;
    }
    Some(object)
}

fn read_resource_ref(
    reader: &mut SerializationReader<'_>,
    class: StringId,
) -> Result<Value, SerialError> {
    const EXTERNAL: u8 = 1;
    const INLINED: u8 = 2;

    let mask = reader.read_u8()?;
    let mut result = ResourceRefValue::None;

    if mask & EXTERNAL != 0 {
        if let Some(import) = reader.read_resource()? {
            let compatible = match reader.registry.find_class(import.key.class) {
                Some(cls) => cls.is_a(class),
                // unknown resource classes were already reported during
                // import resolution; keep the reference anyway
                None => true,
            };
            if compatible {
                result = ResourceRefValue::External {
                    key: import.key,
                    promise: import.promise.clone(),
                };
            }
        }
    }

    if mask & INLINED != 0 {
        if let Some(object) = reader.read_pointer(true)? {
            if object.read().expect("object lock poisoned").class().is_a(class) {
                result = ResourceRefValue::Inlined(object);
            }
        }
    }

    Ok(Value::Resource(result))
}

fn read_simple(
    reader: &mut SerializationReader<'_>,
    kind: SimpleKind,
) -> Result<Value, SerialError> {
    Ok(match kind {
        SimpleKind::Bool => Value::Bool(reader.read_u8()? != 0),
        SimpleKind::I8 => Value::I8(reader.read_u8()? as i8),
        SimpleKind::I16 => {
            Value::I16(i16::from_le_bytes(reader.read_bytes(2)?.try_into().unwrap()))
        }
        SimpleKind::I32 => {
            Value::I32(i32::from_le_bytes(reader.read_bytes(4)?.try_into().unwrap()))
        }
        SimpleKind::I64 => {
            Value::I64(i64::from_le_bytes(reader.read_bytes(8)?.try_into().unwrap()))
        }
        SimpleKind::U8 => Value::U8(reader.read_u8()?),
        SimpleKind::U16 => {
            Value::U16(u16::from_le_bytes(reader.read_bytes(2)?.try_into().unwrap()))
        }
        SimpleKind::U32 => {
            Value::U32(u32::from_le_bytes(reader.read_bytes(4)?.try_into().unwrap()))
        }
        SimpleKind::U64 => {
            Value::U64(u64::from_le_bytes(reader.read_bytes(8)?.try_into().unwrap()))
        }
        SimpleKind::F32 => {
            Value::F32(f32::from_le_bytes(reader.read_bytes(4)?.try_into().unwrap()))
        }
        SimpleKind::F64 => {
            Value::F64(f64::from_le_bytes(reader.read_bytes(8)?.try_into().unwrap()))
        }
        SimpleKind::String => {
            let size = reader.read_compressed_number()? as usize;
            let bytes = reader.read_bytes(size)?;
            Value::Str(String::from_utf8(bytes.to_vec()).map_err(|e| {
                SerialError::MalformedPayload(format!("invalid UTF-8 string: {e}"))
            })?)
        }
    })
}

/// Decodes a compound's property list into `fields`, tolerating stale
/// rows. Used for inline struct values; object payloads add hooks on top
/// via [`read_object_compound`].
pub fn read_compound_fields(
    reader: &mut SerializationReader<'_>,
    class: &Arc<ClassDef>,
    fields: &mut [Value],
) -> Result<(), SerialError> {
    read_compound(reader, class, &mut |slot, value| {
        fields[slot] = value;
    }, &mut |_, _| false, &mut |_, _| false)
}

/// Reads an object's payload compound, offering the class hooks a chance
/// to absorb missing and retyped properties.
pub fn read_object_compound(
    reader: &mut SerializationReader<'_>,
    object: &ObjectRef,
) -> Result<(), SerialError> {
    let class = {
        let guard = object.read().expect("object lock poisoned");
        Arc::clone(guard.class())
    };
    let missing_hook = class.hooks.property_missing.clone();
    let retyped_hook = class.hooks.property_type_changed.clone();

    let apply_object = Arc::clone(object);
    let missing_object = Arc::clone(object);
    let retyped_object = Arc::clone(object);

    read_compound(
        reader,
        &class,
        &mut move |slot, value| {
            apply_object
                .write()
                .expect("object lock poisoned")
                .set_value_at(slot, value);
        },
        &mut move |name, value| match &missing_hook {
            Some(hook) => {
                let mut guard = missing_object.write().expect("object lock poisoned");
                hook(&mut guard, name, value)
            }
            None => false,
        },
        &mut move |name, value| match &retyped_hook {
            Some(hook) => {
                let mut guard = retyped_object.write().expect("object lock poisoned");
                hook(&mut guard, name, value)
            }
            None => false,
        },
    )
}

fn read_compound(
    reader: &mut SerializationReader<'_>,
    class: &Arc<ClassDef>,
    apply: &mut dyn FnMut(usize, Value),
    on_missing: &mut dyn FnMut(StringId, Option<&Value>) -> bool,
    on_type_changed: &mut dyn FnMut(StringId, &Value) -> bool,
) -> Result<(), SerialError> {
    loop {
        let index = reader.read_compressed_number()? as usize;
        if index == 0 {
            return Ok(());
        }
        let row = reader
            .refs
            .properties
            .get(index)
            .ok_or(SerialError::BadReference {
                what: "properties",
                index: index as u64,
                len: reader.refs.properties.len(),
            })?;
        let row_name = row.name;
        let row_type_name = row.type_name;
        let row_ty = row.ty.clone();

        let block = reader.enter_skip_block()?;

        match class.find_property(row_name) {
            Some((slot, prop)) if prop.ty.name() == row_type_name => {
                match read_value(reader, &prop.ty.clone()) {
                    Ok(value) => apply(slot, value),
                    Err(error) => {
                        // the frame bounds the damage to this one property
                        warn!(property = %row_name, %error, "unreadable property value, keeping default");
                    }
                }
            }
            Some((_, prop)) => {
                reader.reporter.report_property_type_changed(
                    &reader.context,
                    class.name,
                    row_name,
                    row_type_name,
                    prop.ty.name(),
                );
                let loaded = row_ty.and_then(|ty| read_value(reader, &ty).ok());
                if let Some(loaded) = &loaded {
                    on_type_changed(row_name, loaded);
                }
            }
            None => {
                reader
                    .reporter
                    .report_property_missing(&reader.context, class.name, row_name);
                let loaded = row_ty.and_then(|ty| read_value(reader, &ty).ok());
                on_missing(row_name, loaded.as_ref());
            }
        }

        reader.leave_skip_block(block);
    }
}
