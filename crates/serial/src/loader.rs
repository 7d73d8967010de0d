//! Binary load pipeline.
//!
//! Table validation happens first and is all-or-nothing; reference
//! resolution follows (names, types, properties, imports, exports,
//! buffers), and only then are object payloads applied. Semantic problems
//! degrade per value and are reported; the load carries on with defaults.

use std::collections::HashMap;
use std::sync::Arc;

use membuf::{AsyncBufferRef, Buffer, CompressionType, ResidentCompressedBuffer};
use rtti::{
    Object, ObjectRef, ResourceId, ResourceKey, ResourcePromise, StringId, run_post_load,
};
use tracing::{debug, warn};

use crate::context::{BufferPlacement, ObjectLoadingContext};
use crate::error::SerialError;
use crate::reader::{
    read_object_compound, ResolvedImport, ResolvedProperty, ResolvedReferences,
    SerializationReader,
};
use crate::tables::{ChunkType, FileTables, EXPORT_FLAG_ROOT, FLAG_EXTRACTED_BUFFERS,
    VERSION_IMPORT_TABLE};

fn resolve_names(tables: &FileTables<'_>, refs: &mut ResolvedReferences) {
    let count = tables.chunk_count(ChunkType::Names);
    refs.names.reserve(count as usize);
    for index in 0..count {
        let text = tables.string_at(tables.name_row(index));
        refs.names.push(StringId::intern(text));
    }
}

fn resolve_types(
    tables: &FileTables<'_>,
    ctx: &ObjectLoadingContext,
    refs: &mut ResolvedReferences,
) {
    let count = tables.chunk_count(ChunkType::Types);
    refs.types.reserve(count as usize);
    refs.type_names.reserve(count as usize);
    for index in 0..count {
        let name = refs.names[tables.type_row(index) as usize];
        refs.type_names.push(name);
        if name.is_empty() {
            refs.types.push(None);
            continue;
        }
        let ty = ctx.registry.find_type(name);
        if ty.is_none() {
            ctx.reporter.report_type_missing(&ctx.context_path, name);
        }
        refs.types.push(ty);
    }
}

fn resolve_properties(tables: &FileTables<'_>, refs: &mut ResolvedReferences) {
    let count = tables.chunk_count(ChunkType::Properties);
    refs.properties.reserve(count as usize);
    for index in 0..count {
        let row = tables.property_row(index);
        refs.properties.push(ResolvedProperty {
            declaring_class: refs.type_names[row.class_type as usize],
            name: refs.names[row.name as usize],
            type_name: refs.type_names[row.type_index as usize],
            ty: refs.types[row.type_index as usize].clone(),
        });
    }
}

fn resolve_imports(
    tables: &FileTables<'_>,
    ctx: &mut ObjectLoadingContext,
    refs: &mut ResolvedReferences,
) {
    // older files predate the import table; resources degrade to null
    if tables.header().version < VERSION_IMPORT_TABLE {
        return;
    }

    let count = tables.chunk_count(ChunkType::Imports);
    let mut first_by_id: HashMap<ResourceId, usize> = HashMap::new();
    refs.imports.reserve(count as usize);

    for index in 0..count {
        let row = tables.import_row(index);
        let class = refs.type_names[row.class_type as usize];
        let key = ResourceKey::new(ResourceId::from_bytes(row.guid), class);

        if ctx.registry.find_class(class).is_none() {
            ctx.reporter
                .report_resource_class_missing(&ctx.context_path, class);
        }

        // the same GUID under a different class is a schema conflict; the
        // first entry wins
        if let Some(&first) = first_by_id.get(&key.id) {
            let (first_key, promise) = {
                let first_import = &refs.imports[first];
                (first_import.key, first_import.promise.clone())
            };
            if first_key.class != class {
                ctx.reporter
                    .report_duplicate_import(&ctx.context_path, &key.id.to_string());
            }
            refs.imports.push(ResolvedImport {
                key: first_key,
                promise,
            });
            continue;
        }
        first_by_id.insert(key.id, refs.imports.len());

        let promise = if ctx.context_path.is_empty() {
            ResourcePromise::empty(key)
        } else {
            ResourcePromise::with_path(key, &ctx.context_path)
        };
        if ctx.collect_promises {
            ctx.resource_promises.push(Arc::clone(&promise));
        } else {
            // nobody will ever resolve it
            promise.fulfill(None);
        }
        refs.imports.push(ResolvedImport {
            key,
            promise: Some(promise),
        });
    }
}

fn resolve_exports(
    tables: &FileTables<'_>,
    ctx: &mut ObjectLoadingContext,
    refs: &mut ResolvedReferences,
) -> Option<ObjectRef> {
    let count = tables.chunk_count(ChunkType::Exports);
    let mut root: Option<ObjectRef> = None;
    refs.objects.reserve(count as usize);

    for index in 0..count {
        let row = tables.export_row(index);
        let class_name = refs.type_names[row.class_type as usize];

        let Some(class) = ctx.registry.find_class(class_name) else {
            // the unknown type was already reported once while resolving
            // the type table
            refs.objects.push(None);
            continue;
        };
        if !class.constructible() {
            ctx.reporter
                .report_class_not_creatable(&ctx.context_path, class_name);
            refs.objects.push(None);
            continue;
        }

        let selective = ctx.selective_classes.is_some();
        if let Some(wanted) = &ctx.selective_classes {
            if !wanted.contains(&class_name) {
                refs.objects.push(None);
                continue;
            }
        }

        let Ok(object) = Object::create(&class) else {
            ctx.reporter
                .report_class_not_creatable(&ctx.context_path, class_name);
            refs.objects.push(None);
            continue;
        };

        if selective {
            ctx.selective_objects.push(Arc::clone(&object));
        }

        if index == 0 && !ctx.context_path.is_empty() && class.is_resource {
            object
                .write()
                .expect("object lock poisoned")
                .bind_load_path(&ctx.context_path);
        }

        if row.flags & EXPORT_FLAG_ROOT != 0 {
            if root.is_none() {
                let acceptable = match ctx.expected_root_class {
                    Some(expected) => class.is_a(expected),
                    None => true,
                };
                if acceptable {
                    root = Some(Arc::clone(&object));
                }
            }
            ctx.collected_roots.push(Arc::clone(&object));
        }

        refs.objects.push(Some(object));
    }
    root
}

fn resolve_buffers(
    tables: &FileTables<'_>,
    ctx: &ObjectLoadingContext,
    refs: &mut ResolvedReferences,
    data: &[u8],
) -> Result<(), SerialError> {
    let count = tables.chunk_count(ChunkType::Buffers);
    let extracted = tables.header().flags & FLAG_EXTRACTED_BUFFERS != 0;

    for index in 0..count {
        let row = tables.buffer_row(index);
        if refs.buffers.contains_key(&row.crc) {
            warn!(crc = row.crc, "buffer registered twice, keeping the first");
            continue;
        }
        let compression = CompressionType::from_u8(row.compression).ok_or_else(|| {
            SerialError::MalformedPayload(format!(
                "unknown compression type {}",
                row.compression
            ))
        })?;
        let placement = BufferPlacement {
            offset: row.data_offset as u64,
            compressed_size: row.compressed_size as u64,
            uncompressed_size: row.uncompressed_size,
            compression,
        };

        let loader: Option<AsyncBufferRef> = if let Some(factory) = &ctx.buffer_factory {
            factory.create_loader(row.crc, &placement)
        } else if extracted {
            // data lives out of band and nothing can fetch it
            None
        } else if let Some(owner) = &ctx.owned_buffer {
            let compressed =
                owner.create_sub_buffer(row.data_offset as usize, row.compressed_size as usize)?;
            Some(ResidentCompressedBuffer::new(
                compressed,
                compression,
                row.uncompressed_size,
                row.crc,
            ) as AsyncBufferRef)
        } else {
            let start = row.data_offset as usize;
            let end = start + row.compressed_size as usize;
            let compressed = Buffer::from_slice(&data[start..end]);
            Some(ResidentCompressedBuffer::new(
                compressed,
                compression,
                row.uncompressed_size,
                row.crc,
            ) as AsyncBufferRef)
        };

        match loader {
            Some(loader) => {
                refs.buffers.insert(row.crc, loader);
            }
            None => warn!(crc = row.crc, "no loader available for buffer"),
        }
    }
    Ok(())
}

/// Loads an object graph from the binary format. Returns the root object.
pub fn load_binary(
    ctx: &mut ObjectLoadingContext,
    data: &[u8],
) -> Result<ObjectRef, SerialError> {
    let tables = FileTables::parse(data)?;
    let version = tables.header().version;

    let mut refs = ResolvedReferences::default();
    resolve_names(&tables, &mut refs);
    resolve_types(&tables, ctx, &mut refs);
    resolve_properties(&tables, &mut refs);
    resolve_imports(&tables, ctx, &mut refs);
    let root = resolve_exports(&tables, ctx, &mut refs);
    resolve_buffers(&tables, ctx, &mut refs, data)?;

    // apply payloads in export order; construction already happened,
    // post-load strictly follows
    let reporter = Arc::clone(&ctx.reporter);
    for index in 0..tables.chunk_count(ChunkType::Exports) {
        let Some(object) = refs.objects[index as usize].clone() else {
            continue;
        };
        let row = tables.export_row(index);
        let start = row.data_offset as usize;
        let payload = &data[start..start + row.data_size as usize];
        if crc32c::crc32c(payload) != row.crc {
            return Err(SerialError::MalformedPayload(format!(
                "object {index} payload failed its checksum"
            )));
        }

        let mut reader = SerializationReader::new(
            payload,
            version,
            &refs,
            &ctx.registry,
            &reporter,
            &ctx.context_path,
        );
        reader.set_current_parent(Some(Arc::clone(&object)));
        if let Err(error) = read_object_compound(&mut reader, &object) {
            // this object keeps whatever was applied; siblings are safe
            warn!(export = index, %error, "object payload aborted");
        }
    }

    for object in refs.objects.iter().flatten() {
        run_post_load(object);
    }

    debug!(
        objects = refs.objects.iter().flatten().count(),
        imports = refs.imports.len(),
        "binary load complete"
    );
    root.ok_or(SerialError::NoRootObject)
}

/// Reads only the file tables to find where a buffer lives; nothing else
/// is loaded or resolved.
pub fn locate_buffer_placement(
    data: &[u8],
    crc: u64,
) -> Result<Option<BufferPlacement>, SerialError> {
    let tables = FileTables::parse(data)?;
    for index in 0..tables.chunk_count(ChunkType::Buffers) {
        let row = tables.buffer_row(index);
        if row.crc == crc {
            let compression = CompressionType::from_u8(row.compression).ok_or_else(|| {
                SerialError::MalformedPayload(format!(
                    "unknown compression type {}",
                    row.compression
                ))
            })?;
            return Ok(Some(BufferPlacement {
                offset: row.data_offset as u64,
                compressed_size: row.compressed_size as u64,
                uncompressed_size: row.uncompressed_size,
                compression,
            }));
        }
    }
    Ok(None)
}

/// Extracts the external resource keys a file references without loading
/// any objects.
pub fn read_dependencies(data: &[u8]) -> Result<Vec<ResourceKey>, SerialError> {
    let tables = FileTables::parse(data)?;
    let mut keys = Vec::new();
    if tables.header().version < VERSION_IMPORT_TABLE {
        return Ok(keys);
    }

    // names and types only; the rest of the file stays untouched
    let mut names = Vec::new();
    for index in 0..tables.chunk_count(ChunkType::Names) {
        names.push(StringId::intern(tables.string_at(tables.name_row(index))));
    }
    for index in 0..tables.chunk_count(ChunkType::Imports) {
        let row = tables.import_row(index);
        let class = names[tables.type_row(row.class_type as u32) as usize];
        keys.push(ResourceKey::new(ResourceId::from_bytes(row.guid), class));
    }
    Ok(keys)
}
