//! Top-level save/load entry points.
//!
//! Dispatches by format and sink. Binary goes through the opcode pipeline;
//! the text formats run the two-pass tree writers. Loading returns the
//! root object or a structural error; semantic problems land in the
//! context's reporter.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rtti::{run_post_load, ObjectRef, TypeDef, Value};

use crate::context::{ObjectLoadingContext, ObjectSavingContext, SerializationFormat};
use crate::error::SerialError;
use crate::loader::load_binary;
use crate::saver::save_binary;
use crate::text::{
    dom, write_value_text, JsonTextWriter, TextObjectMap, TextObjectMapper, TextValueWriter,
    XmlTextReader, XmlTextWriter,
};

fn auto_root_name(ty: Option<&TypeDef>, ctx: &ObjectSavingContext) -> String {
    if let Some(name) = &ctx.root_node_name {
        return name.clone();
    }
    match ty {
        Some(TypeDef::Array { .. }) => "array".to_string(),
        Some(TypeDef::StrongHandle(_)) | Some(TypeDef::WeakHandle(_)) => "object".to_string(),
        _ => "data".to_string(),
    }
}

fn run_mapper(
    ctx: &mut ObjectSavingContext,
    walk: impl Fn(&mut TextObjectMapper) -> Result<(), SerialError>,
) -> Result<TextObjectMap, SerialError> {
    let mut mapper = TextObjectMapper::new();
    walk(&mut mapper)?;
    let map = mapper.finish();
    if ctx.collect_resources {
        ctx.extracted_resources.extend(map.resources.iter().copied());
    }
    Ok(map)
}

/// Serializes `object` (and its strong closure) into `format`.
pub fn save_object(
    format: SerializationFormat,
    ctx: &mut ObjectSavingContext,
    object: &ObjectRef,
) -> Result<Bytes, SerialError> {
    match format {
        SerializationFormat::Binary => Ok(Bytes::from(save_binary(ctx, object)?)),
        SerializationFormat::Xml => {
            let map = run_mapper(ctx, |mapper| {
                mapper.write_value_object(Some(object), true);
                Ok(())
            })?;
            let class = {
                let guard = object.read().expect("object lock poisoned");
                guard.class().name
            };
            let root_ty = TypeDef::StrongHandle(class);
            let root_name = auto_root_name(Some(&root_ty), ctx);

            let mut writer = XmlTextWriter::new(&map, &root_name);
            writer.write_value_object(Some(object), true);
            let text = dom::render(&writer.finish(), ctx.print_flags)?;
            Ok(Bytes::from(text))
        }
        SerializationFormat::Json => {
            let map = run_mapper(ctx, |mapper| {
                mapper.write_value_object(Some(object), true);
                Ok(())
            })?;
            let mut writer = JsonTextWriter::new(&map);
            writer.write_value_object(Some(object), true);
            let value = writer.finish();
            let text = if ctx.print_flags.indent {
                serde_json::to_string_pretty(&value)
            } else {
                serde_json::to_string(&value)
            }
            .map_err(|e| SerialError::TextParse(format!("JSON render error: {e}")))?;
            Ok(Bytes::from(text))
        }
    }
}

/// Serializes a standalone typed value; text formats only.
pub fn save_value(
    format: SerializationFormat,
    ctx: &mut ObjectSavingContext,
    ty: &TypeDef,
    value: &Value,
) -> Result<Bytes, SerialError> {
    match format {
        SerializationFormat::Binary => Err(SerialError::UnsupportedFormat),
        SerializationFormat::Xml => {
            let map = run_mapper(ctx, |mapper| write_value_text(mapper, ty, value))?;
            let root_name = auto_root_name(Some(ty), ctx);
            let mut writer = XmlTextWriter::new(&map, &root_name);
            write_value_text(&mut writer, ty, value)?;
            let text = dom::render(&writer.finish(), ctx.print_flags)?;
            Ok(Bytes::from(text))
        }
        SerializationFormat::Json => {
            let map = run_mapper(ctx, |mapper| write_value_text(mapper, ty, value))?;
            let mut writer = JsonTextWriter::new(&map);
            write_value_text(&mut writer, ty, value)?;
            let rendered = writer.finish();
            let text = if ctx.print_flags.indent {
                serde_json::to_string_pretty(&rendered)
            } else {
                serde_json::to_string(&rendered)
            }
            .map_err(|e| SerialError::TextParse(format!("JSON render error: {e}")))?;
            Ok(Bytes::from(text))
        }
    }
}

/// Loads an object graph from bytes in `format`. Returns the root.
pub fn load_object(
    format: SerializationFormat,
    ctx: &mut ObjectLoadingContext,
    data: &[u8],
) -> Result<ObjectRef, SerialError> {
    match format {
        SerializationFormat::Binary => load_binary(ctx, data),
        SerializationFormat::Xml => {
            let text = std::str::from_utf8(data)
                .map_err(|e| SerialError::TextParse(format!("input is not UTF-8: {e}")))?;
            load_object_xml(ctx, text)
        }
        SerializationFormat::Json => Err(SerialError::UnsupportedFormat),
    }
}

fn load_object_xml(
    ctx: &mut ObjectLoadingContext,
    text: &str,
) -> Result<ObjectRef, SerialError> {
    let root_node = dom::parse(text)?;
    let mut reader = XmlTextReader::new(ctx);
    let root = reader.read_object(&root_node);

    for object in &reader.created {
        run_post_load(object);
    }
    ctx.resource_promises.extend(reader.promises.drain(..));

    let root = root.ok_or(SerialError::NoRootObject)?;
    if let Some(expected) = ctx.expected_root_class {
        let acceptable = root
            .read()
            .expect("object lock poisoned")
            .class()
            .is_a(expected);
        if !acceptable {
            return Err(SerialError::NoRootObject);
        }
    }
    ctx.collected_roots.push(Arc::clone(&root));
    Ok(root)
}

/// Loads a standalone typed value from XML text.
pub fn load_value(
    ctx: &mut ObjectLoadingContext,
    text: &str,
    ty: &TypeDef,
) -> Result<Value, SerialError> {
    let root_node = dom::parse(text)?;
    let mut reader = XmlTextReader::new(ctx);
    let value = reader.read_value(&root_node, ty);

    for object in &reader.created {
        run_post_load(object);
    }
    ctx.resource_promises.extend(reader.promises.drain(..));
    Ok(value)
}

/// Streams a save into any writer sink.
pub fn save_object_to_writer(
    format: SerializationFormat,
    ctx: &mut ObjectSavingContext,
    object: &ObjectRef,
    out: &mut dyn Write,
) -> Result<(), SerialError> {
    let bytes = save_object(format, ctx, object)?;
    out.write_all(&bytes)?;
    Ok(())
}

/// Saves straight to a filesystem path.
pub fn save_object_to_file(
    format: SerializationFormat,
    ctx: &mut ObjectSavingContext,
    object: &ObjectRef,
    path: &Path,
) -> Result<(), SerialError> {
    let bytes = save_object(format, ctx, object)?;
    std::fs::write(path, &bytes)?;
    Ok(())
}

/// Loads from any reader source.
pub fn load_object_from_reader(
    format: SerializationFormat,
    ctx: &mut ObjectLoadingContext,
    input: &mut dyn Read,
) -> Result<ObjectRef, SerialError> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;
    load_object(format, ctx, &data)
}

/// Loads from a filesystem path; the path doubles as the report context.
pub fn load_object_from_file(
    format: SerializationFormat,
    ctx: &mut ObjectLoadingContext,
    path: &Path,
) -> Result<ObjectRef, SerialError> {
    if ctx.context_path.is_empty() {
        ctx.context_path = path.display().to_string();
    }
    let data = std::fs::read(path)?;
    load_object(format, ctx, &data)
}
