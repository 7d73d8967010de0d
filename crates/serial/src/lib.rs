//! Object graph serialization engine.
//!
//! Serializes graphs of reflected objects (pointers, cycles, shared
//! references, external resources, inline and out-of-line buffers) into a
//! self-describing, versioned binary format and a parallel XML form (with
//! a JSON writer). Writers lower values into an opcode stream that a
//! binary packer turns into an indexed, checksummed file; readers validate
//! the tables first and then replay payloads through the type system,
//! degrading gracefully when types or properties have moved on.

pub mod adaptive;
pub mod context;
pub mod error;
pub mod facade;
pub mod loader;
pub mod packer;
pub mod reader;
pub mod saver;
pub mod stream;
pub mod tables;
pub mod text;
pub mod writer;

pub use context::*;
pub use error::*;
pub use facade::*;
pub use loader::{load_binary, locate_buffer_placement, read_dependencies};
pub use reader::{ResolvedImport, ResolvedProperty, ResolvedReferences, SerializationReader};
pub use saver::save_binary;
pub use stream::{InlineBufferSlot, Op, OpcodeStream, OpcodeTag, PagePool, StreamIterator};
pub use tables::{
    BufferRow, ChunkType, ExportRow, FileHeader, FileTables, ImportRow, PropertyRow,
    EXPORT_FLAG_ROOT, FILE_MAGIC, FILE_VERSION_CURRENT, FILE_VERSION_MAX, FILE_VERSION_MIN,
    FLAG_EXTRACTED_BUFFERS,
};
pub use writer::{
    write_object_payload, write_value, OrderedSet, PropertyKey, SerializationWriter,
    WriterReferences,
};
