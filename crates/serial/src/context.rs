//! Saving and loading contexts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use membuf::{Buffer, CompressionType};
use rtti::{ObjectRef, ResourceKey, ResourcePromiseRef, StringId, TypeRegistry};

use crate::error::{ErrorReporter, NullErrorReporter};

/// Serialization formats the façade dispatches between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerializationFormat {
    Binary,
    Xml,
    Json,
}

/// Text pretty-printing switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrintFlags {
    /// Suppress the `<?xml …?>` declaration.
    pub no_header: bool,
    /// Indent nested elements.
    pub indent: bool,
}

/// A buffer that was routed out of the file in extracted-buffers mode.
#[derive(Clone, Debug)]
pub struct ExtractedBuffer {
    pub compressed_data: Buffer,
    pub compression: CompressionType,
    pub uncompressed_size: u64,
    pub uncompressed_crc: u64,
}

/// Everything a save operation needs beyond the object itself.
pub struct ObjectSavingContext {
    pub registry: Arc<TypeRegistry>,
    /// Byte budget for the opcode stream pages; `None` means unbounded.
    pub page_budget: Option<usize>,
    /// Store every buffer inline in the object payload instead of the
    /// buffer table.
    pub inline_all_buffers: bool,
    /// Store table buffers uncompressed.
    pub decompress_buffers: bool,
    /// Route compressed buffers to `extracted_buffers` instead of the file.
    pub extract_buffers: bool,
    pub extracted_buffers: HashMap<u64, ExtractedBuffer>,
    /// Collect the external resource keys the saved graph references.
    pub collect_resources: bool,
    pub extracted_resources: HashSet<ResourceKey>,
    /// Root element name override for text formats.
    pub root_node_name: Option<String>,
    pub print_flags: PrintFlags,
}

impl ObjectSavingContext {
    pub fn new(registry: &Arc<TypeRegistry>) -> ObjectSavingContext {
        ObjectSavingContext {
            registry: Arc::clone(registry),
            page_budget: None,
            inline_all_buffers: false,
            decompress_buffers: false,
            extract_buffers: false,
            extracted_buffers: HashMap::new(),
            collect_resources: false,
            extracted_resources: HashSet::new(),
            root_node_name: None,
            print_flags: PrintFlags::default(),
        }
    }
}

impl Default for ObjectSavingContext {
    fn default() -> Self {
        ObjectSavingContext::new(TypeRegistry::global())
    }
}

/// Placement of one out-of-line buffer inside a serialized file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPlacement {
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: CompressionType,
}

/// Hands out loaders for buffers that live outside the loaded bytes
/// (separate blob files, pak windows). Consulted before any fallback.
pub trait SerializationBufferFactory: Send + Sync {
    fn create_loader(&self, crc: u64, placement: &BufferPlacement)
        -> Option<membuf::AsyncBufferRef>;
}

/// Everything a load operation needs beyond the bytes.
pub struct ObjectLoadingContext {
    pub registry: Arc<TypeRegistry>,
    pub buffer_factory: Option<Arc<dyn SerializationBufferFactory>>,
    /// Shown in every report; usually the path being loaded.
    pub context_path: String,
    /// When set, the returned root must be of (or derive from) this class.
    pub expected_root_class: Option<StringId>,
    /// When set, only objects of these classes are constructed.
    pub selective_classes: Option<HashSet<StringId>>,
    /// Objects constructed under selective loading.
    pub selective_objects: Vec<ObjectRef>,
    /// Collect promises instead of auto-fulfilling them to null.
    pub collect_promises: bool,
    pub resource_promises: Vec<ResourcePromiseRef>,
    /// Every object whose export carries the root flag.
    pub collected_roots: Vec<ObjectRef>,
    pub reporter: Arc<dyn ErrorReporter>,
    /// When the caller owns the loaded bytes, buffer loaders view into this
    /// storage instead of copying.
    pub owned_buffer: Option<Buffer>,
}

impl ObjectLoadingContext {
    pub fn new(registry: &Arc<TypeRegistry>) -> ObjectLoadingContext {
        ObjectLoadingContext {
            registry: Arc::clone(registry),
            buffer_factory: None,
            context_path: String::new(),
            expected_root_class: None,
            selective_classes: None,
            selective_objects: Vec::new(),
            collect_promises: false,
            resource_promises: Vec::new(),
            collected_roots: Vec::new(),
            reporter: Arc::new(NullErrorReporter),
            owned_buffer: None,
        }
    }
}

impl Default for ObjectLoadingContext {
    fn default() -> Self {
        ObjectLoadingContext::new(TypeRegistry::global())
    }
}
