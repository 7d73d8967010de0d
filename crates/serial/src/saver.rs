//! Binary save pipeline.
//!
//! Collection walks the strong-reference closure breadth-first, producing
//! one opcode stream per object plus the shared reference sets. The table
//! builder then assigns indices in first-seen order, payloads are packed
//! back to back, buffers are appended (or extracted) and the header is
//! written a second time with the final offsets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use membuf::{Buffer, CompressionType};
use rtti::{ObjectRef, ResourceKey, StringId};
use tracing::debug;

use crate::context::{ExtractedBuffer, ObjectSavingContext};
use crate::error::SerialError;
use crate::packer::{pack_stream, MappedReferences};
use crate::stream::{OpcodeStream, PagePool};
use crate::tables::{
    BufferRow, ChunkInfo, ChunkType, ExportRow, FileHeader, ImportRow, PropertyRow, EXPORT_FLAG_ROOT,
    FILE_MAGIC, FILE_VERSION_CURRENT, FLAG_EXTRACTED_BUFFERS, HEADER_SIZE,
};
use crate::writer::{
    write_object_payload, PropertyKey, SerializationWriter, WriterReferences,
};

struct SerializedObject {
    object: ObjectRef,
    stream: OpcodeStream,
    root: bool,
}

/// Walks the strong closure from `root`, serializing every object into its
/// own opcode stream. Discovery order is the export order.
fn collect_objects(
    ctx: &ObjectSavingContext,
    root: &ObjectRef,
    references: &mut WriterReferences,
) -> Result<Vec<SerializedObject>, SerialError> {
    let mut objects: Vec<SerializedObject> = Vec::new();
    let mut visited: HashSet<u64> = HashSet::new();
    let mut queue: VecDeque<ObjectRef> = VecDeque::new();

    let root_id = root.read().expect("object lock poisoned").id();
    visited.insert(root_id);
    queue.push_back(Arc::clone(root));

    while let Some(object) = queue.pop_front() {
        let mut stream = OpcodeStream::new(PagePool::new(ctx.page_budget));
        let buffer_compression = if ctx.decompress_buffers {
            CompressionType::None
        } else {
            CompressionType::Lz4
        };
        let strong_refs = {
            let mut writer = SerializationWriter::new(
                &mut stream,
                references,
                ctx.inline_all_buffers,
                buffer_compression,
            );
            write_object_payload(&mut writer, &object)?;
            writer.take_strong_refs()
        };

        for target in strong_refs {
            let id = target.read().expect("object lock poisoned").id();
            if visited.insert(id) {
                queue.push_back(target);
            }
        }

        let root_flag = objects.is_empty();
        objects.push(SerializedObject {
            object,
            stream,
            root: root_flag,
        });
    }

    debug!(objects = objects.len(), "collected strong closure");
    Ok(objects)
}

/// Index-assigning builder for the seven file chunks.
#[derive(Default)]
struct FileTablesBuilder {
    strings: Vec<u8>,
    string_offsets: HashMap<StringId, u32>,
    names: Vec<u32>,
    name_index: HashMap<StringId, u16>,
    types: Vec<u16>,
    type_index: HashMap<StringId, u16>,
    properties: Vec<PropertyRow>,
    property_index: HashMap<PropertyKey, u16>,
    imports: Vec<ImportRow>,
    exports: Vec<ExportRow>,
    buffers: Vec<BufferRow>,
    buffer_data: Vec<Buffer>,
}

impl FileTablesBuilder {
    fn new() -> FileTablesBuilder {
        let mut builder = FileTablesBuilder::default();
        // reserved rows: name 0 is the empty string, type 0 is "no type",
        // property 0 is the compound terminator
        builder.strings.push(0);
        builder.string_offsets.insert(StringId::EMPTY, 0);
        builder.names.push(0);
        builder.name_index.insert(StringId::EMPTY, 0);
        builder.types.push(0);
        builder.type_index.insert(StringId::EMPTY, 0);
        builder.properties.push(PropertyRow::default());
        builder
    }

    fn map_string(&mut self, id: StringId) -> u32 {
        if let Some(&offset) = self.string_offsets.get(&id) {
            return offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(id.as_str().as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(id, offset);
        offset
    }

    fn map_name(&mut self, id: StringId) -> Result<u16, SerialError> {
        if let Some(&index) = self.name_index.get(&id) {
            return Ok(index);
        }
        let index = checked_index(self.names.len(), "names")?;
        let offset = self.map_string(id);
        self.names.push(offset);
        self.name_index.insert(id, index);
        Ok(index)
    }

    fn map_type(&mut self, type_name: StringId) -> Result<u16, SerialError> {
        if let Some(&index) = self.type_index.get(&type_name) {
            return Ok(index);
        }
        let index = checked_index(self.types.len(), "types")?;
        let name = self.map_name(type_name)?;
        self.types.push(name);
        self.type_index.insert(type_name, index);
        Ok(index)
    }

    fn map_property(&mut self, key: PropertyKey) -> Result<u16, SerialError> {
        if let Some(&index) = self.property_index.get(&key) {
            return Ok(index);
        }
        let index = checked_index(self.properties.len(), "properties")?;
        let row = PropertyRow {
            class_type: self.map_type(key.class)?,
            name: self.map_name(key.name)?,
            type_index: self.map_type(key.type_name)?,
        };
        self.properties.push(row);
        self.property_index.insert(key, index);
        Ok(index)
    }

    /// 1-based; 0 stays the null resource encoding.
    fn map_import(&mut self, key: ResourceKey) -> Result<u32, SerialError> {
        let row = ImportRow {
            class_type: self.map_type(key.class)?,
            guid: *key.id.as_bytes(),
        };
        self.imports.push(row);
        Ok(self.imports.len() as u32)
    }

    /// Renders the header plus all chunk bytes. Called twice: first to
    /// reserve the region, then again with the final offsets and row
    /// contents once payloads and buffers are in place.
    fn render(&self, flags: u32, objects_end: u32, buffers_end: u32) -> Vec<u8> {
        let mut chunks: [(ChunkInfo, Vec<u8>); 7] = Default::default();

        chunks[ChunkType::Strings as usize].1 = self.strings.clone();
        for offset in &self.names {
            chunks[ChunkType::Names as usize]
                .1
                .extend_from_slice(&offset.to_le_bytes());
        }
        for name in &self.types {
            chunks[ChunkType::Types as usize]
                .1
                .extend_from_slice(&name.to_le_bytes());
        }
        for row in &self.properties {
            let out = &mut chunks[ChunkType::Properties as usize].1;
            out.extend_from_slice(&row.class_type.to_le_bytes());
            out.extend_from_slice(&row.name.to_le_bytes());
            out.extend_from_slice(&row.type_index.to_le_bytes());
        }
        for row in &self.imports {
            let out = &mut chunks[ChunkType::Imports as usize].1;
            out.extend_from_slice(&row.class_type.to_le_bytes());
            out.extend_from_slice(&row.guid);
        }
        for row in &self.exports {
            let out = &mut chunks[ChunkType::Exports as usize].1;
            out.extend_from_slice(&row.class_type.to_le_bytes());
            out.extend_from_slice(&row.flags.to_le_bytes());
            out.extend_from_slice(&row.data_offset.to_le_bytes());
            out.extend_from_slice(&row.data_size.to_le_bytes());
            out.extend_from_slice(&row.crc.to_le_bytes());
        }
        for row in &self.buffers {
            let out = &mut chunks[ChunkType::Buffers as usize].1;
            out.extend_from_slice(&row.crc.to_le_bytes());
            out.push(row.compression);
            out.extend_from_slice(&row.compressed_size.to_le_bytes());
            out.extend_from_slice(&row.uncompressed_size.to_le_bytes());
            out.extend_from_slice(&row.data_offset.to_le_bytes());
        }

        let mut header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION_CURRENT,
            flags,
            headers_end: 0,
            objects_end,
            buffers_end,
            ..FileHeader::default()
        };

        let mut offset = HEADER_SIZE as u32;
        for (chunk_type, (info, bytes)) in ChunkType::ALL.iter().zip(chunks.iter_mut()) {
            info.offset = offset;
            info.count = match chunk_type {
                ChunkType::Strings => bytes.len() as u32,
                other => (bytes.len() / other.row_size()) as u32,
            };
            info.crc = crc32c::crc32c(bytes);
            header.chunks[*chunk_type as usize] = *info;
            offset += bytes.len() as u32;
        }
        header.headers_end = offset;

        let mut out = Vec::with_capacity(offset as usize);
        header.write_to(&mut out);
        for (_, bytes) in &chunks {
            out.extend_from_slice(bytes);
        }
        out
    }
}

fn checked_index(len: usize, what: &'static str) -> Result<u16, SerialError> {
    u16::try_from(len).map_err(|_| SerialError::TableOverflow {
        what,
        limit: u16::MAX as u32,
    })
}

fn header_flags(ctx: &ObjectSavingContext) -> u32 {
    if ctx.extract_buffers {
        FLAG_EXTRACTED_BUFFERS
    } else {
        0
    }
}

/// Serializes `root` and its strong closure into the binary file format.
pub fn save_binary(
    ctx: &mut ObjectSavingContext,
    root: &ObjectRef,
) -> Result<Vec<u8>, SerialError> {
    let mut references = WriterReferences::new();
    let objects = collect_objects(ctx, root, &mut references)?;

    // assign table indices in first-seen order
    let mut builder = FileTablesBuilder::new();
    let mut mapped = MappedReferences::default();

    for &name in references.string_ids.items() {
        let index = builder.map_name(name)?;
        mapped.names.insert(name, u32::from(index));
    }
    for &type_name in references.types.items() {
        let index = builder.map_type(type_name)?;
        mapped.types.insert(type_name, u32::from(index));
    }
    for &key in references.properties.items() {
        let index = builder.map_property(key)?;
        mapped.properties.insert(key, u32::from(index));
    }
    for &key in references.resources.items() {
        let index = builder.map_import(key)?;
        mapped.imports.insert(key, index);
    }

    for (position, serialized) in objects.iter().enumerate() {
        let guard = serialized.object.read().expect("object lock poisoned");
        let class_type = builder.map_type(guard.class().name)?;
        builder.exports.push(ExportRow {
            class_type,
            flags: if serialized.root { EXPORT_FLAG_ROOT } else { 0 },
            ..ExportRow::default()
        });
        mapped.objects.insert(guard.id(), position as u32 + 1);
    }

    // buffers dedupe on content identity and sort by CRC so placement
    // lookups can binary-search
    let mut loaders = references.async_buffers().to_vec();
    loaders.sort_by_key(|loader| loader.crc());
    let mut seen = HashSet::new();
    for loader in loaders {
        if !seen.insert(loader.crc()) {
            continue;
        }
        let (compressed, compression) = loader.extract()?;
        builder.buffers.push(BufferRow {
            crc: loader.crc(),
            compression: compression as u8,
            compressed_size: compressed.len() as u32,
            uncompressed_size: loader.size(),
            data_offset: 0,
        });
        builder.buffer_data.push(compressed);
    }

    // pass one: reserve the header + chunk region
    let flags = header_flags(ctx);
    let mut out = builder.render(flags, 0, 0);
    let header_len = out.len();

    // object payloads, back to back
    for (position, serialized) in objects.iter().enumerate() {
        let payload = pack_stream(&serialized.stream, &mapped)?;
        let row = &mut builder.exports[position];
        row.data_offset = out.len() as u32;
        row.data_size = payload.len() as u32;
        row.crc = crc32c::crc32c(&payload);
        out.extend_from_slice(&payload);
    }
    let objects_end = out.len() as u32;

    // buffer region, or the extraction map
    for (position, data) in builder.buffer_data.iter().enumerate() {
        let row = &mut builder.buffers[position];
        if ctx.extract_buffers {
            ctx.extracted_buffers.insert(
                row.crc,
                ExtractedBuffer {
                    compressed_data: data.clone(),
                    compression: CompressionType::from_u8(row.compression)
                        .expect("compression recorded from enum"),
                    uncompressed_size: row.uncompressed_size,
                    uncompressed_crc: row.crc,
                },
            );
        } else {
            row.data_offset = out.len() as u32;
            out.extend_from_slice(data.data());
        }
    }
    let buffers_end = out.len() as u32;

    if ctx.collect_resources {
        for &key in references.resources.items() {
            ctx.extracted_resources.insert(key);
        }
    }

    // pass two: final header with real offsets, counts and checksums
    let final_header = builder.render(flags, objects_end, buffers_end);
    debug_assert_eq!(final_header.len(), header_len);
    out[..header_len].copy_from_slice(&final_header);

    debug!(
        bytes = out.len(),
        objects = builder.exports.len(),
        buffers = builder.buffers.len(),
        "binary save complete"
    );
    Ok(out)
}
