//! Format-independent text emission.
//!
//! The value walker lowers typed values into a small tree vocabulary of
//! arrays, named struct elements, leaf text, leaf bytes, object values and
//! resource values; each concrete writer (the reference mapper, XML, JSON)
//! renders that vocabulary its own way.

use std::sync::Arc;

use rtti::{ObjectRef, ResourceRefValue, StringId, TypeDef, Value};
use tracing::warn;

use crate::error::SerialError;

/// Receiver for the text vocabulary.
pub trait TextValueWriter {
    fn begin_array(&mut self) {}
    fn end_array(&mut self) {}
    fn begin_array_element(&mut self);
    fn end_array_element(&mut self);
    fn begin_struct(&mut self) {}
    fn end_struct(&mut self) {}
    fn begin_struct_element(&mut self, name: &str);
    fn end_struct_element(&mut self);
    fn write_value_text(&mut self, text: &str);
    fn write_value_bytes(&mut self, data: &[u8]);
    fn write_value_object(&mut self, object: Option<&ObjectRef>, strong: bool);
    fn write_value_resource(&mut self, resource: &ResourceRefValue);
}

/// Writes `value` into the current position of `writer`.
pub fn write_value_text<W: TextValueWriter + ?Sized>(
    writer: &mut W,
    ty: &TypeDef,
    value: &Value,
) -> Result<(), SerialError> {
    match (ty, value) {
        (TypeDef::Simple(_), value) => writer.write_value_text(&simple_to_text(value)),
        (TypeDef::Enum(def), Value::Enum(raw)) => match def.find_name(*raw) {
            Some(name) => writer.write_value_text(name.as_str()),
            // numeric fallback keeps unknown values round-trippable
            None => writer.write_value_text(&raw.to_string()),
        },
        (TypeDef::Bitfield(def), Value::Bitfield(bits)) => {
            let mut text = String::new();
            for bit in 0..64u8 {
                if bits & (1u64 << bit) == 0 {
                    continue;
                }
                if !text.is_empty() {
                    text.push(';');
                }
                match def.flag_name(bit) {
                    Some(name) => text.push_str(name.as_str()),
                    None => text.push_str(&bit.to_string()),
                }
            }
            writer.write_value_text(&text);
        }
        (TypeDef::Array { element, .. }, Value::Array(items)) => {
            writer.begin_array();
            for item in items {
                writer.begin_array_element();
                write_value_text(writer, element, item)?;
                writer.end_array_element();
            }
            writer.end_array();
        }
        (TypeDef::Class(_), Value::Struct(inner)) => {
            writer.begin_struct();
            for ((prop, field), default) in inner
                .class
                .properties()
                .iter()
                .zip(inner.fields.iter())
                .zip(inner.class.properties().iter().map(|p| p.default_value()))
            {
                if prop.transient || *field == default {
                    continue;
                }
                writer.begin_struct_element(prop.name.as_str());
                write_value_text(writer, &prop.ty, field)?;
                writer.end_struct_element();
            }
            writer.end_struct();
        }
        (TypeDef::ClassRef, Value::ClassRef(name)) => match name {
            Some(name) => writer.write_value_text(name.as_str()),
            None => writer.write_value_text("null"),
        },
        (TypeDef::StrongHandle(_), Value::Object(object)) => {
            writer.write_value_object(object.as_ref(), true);
        }
        (TypeDef::WeakHandle(_), Value::Weak(weak)) => {
            writer.write_value_object(weak.upgrade().as_ref(), false);
        }
        (TypeDef::ResourceRef(_), Value::Resource(resource)) => {
            writer.write_value_resource(resource);
        }
        (TypeDef::Buffer, Value::Buffer(buffer)) => {
            writer.write_value_bytes(buffer.data());
        }
        (TypeDef::AsyncBuffer, Value::AsyncBuffer(loader)) => match loader {
            Some(loader) => match loader.load() {
                Ok(content) => writer.write_value_bytes(content.data()),
                Err(error) => {
                    warn!(%error, "async buffer unavailable for text save");
                    writer.write_value_bytes(&[]);
                }
            },
            None => writer.write_value_bytes(&[]),
        },
        (TypeDef::Variant, Value::Variant(inner)) => match inner {
            None => writer.write_value_text("null"),
            Some(boxed) => {
                let (inner_ty, inner_value) = boxed.as_ref();
                writer.begin_struct();
                writer.begin_struct_element("type");
                writer.write_value_text(inner_ty.name().as_str());
                writer.end_struct_element();
                writer.begin_struct_element("value");
                write_value_text(writer, inner_ty, inner_value)?;
                writer.end_struct_element();
                writer.end_struct();
            }
        },
        (TypeDef::Custom(def), Value::Custom(_, stored)) => {
            let text = (def.write_text)(stored);
            writer.write_value_text(&text);
        }
        (ty, value) => {
            return Err(SerialError::MalformedPayload(format!(
                "value of kind '{}' cannot be written as '{}'",
                value.kind_name(),
                ty.name()
            )))
        }
    }
    Ok(())
}

/// Writes an object's properties as struct elements, suppressing values
/// equal to their defaults.
pub fn write_object_body<W: TextValueWriter + ?Sized>(
    writer: &mut W,
    object: &ObjectRef,
) -> Result<(), SerialError> {
    let guard = object.read().expect("object lock poisoned");
    let class = Arc::clone(guard.class());
    writer.begin_struct();
    for (prop, value) in class.properties().iter().zip(guard.values().iter()) {
        if prop.transient || *value == prop.default_value() {
            continue;
        }
        writer.begin_struct_element(prop.name.as_str());
        write_value_text(writer, &prop.ty, value)?;
        writer.end_struct_element();
    }
    writer.end_struct();
    Ok(())
}

/// Class name of an object, for `class="…"` attributes.
pub fn object_class_name(object: &ObjectRef) -> StringId {
    object.read().expect("object lock poisoned").class().name
}

fn simple_to_text(value: &Value) -> String {
    match value {
        Value::Bool(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        // Display prints the shortest form that parses back to the same
        // bit pattern
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Str(v) => v.clone(),
        other => unreachable!("not a simple value: {other:?}"),
    }
}
