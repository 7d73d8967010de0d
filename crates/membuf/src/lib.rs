//! Shared byte storage and codecs for the object serialization runtime.
//!
//! This crate provides the storage primitives the serialization engine is
//! built on: refcounted [`Buffer`] cells, non-owning [`BufferView`] ranges,
//! text encodings (Base64/Hex/URL/C-string), block compression
//! (LZ4/LZ4HC/Zlib) and the content-addressed async buffer loaders used for
//! large out-of-line payloads.

pub mod asyncbuf;
pub mod buffer;
pub mod checksum;
pub mod compress;
pub mod encoding;
pub mod error;
pub mod view;

pub use asyncbuf::*;
pub use buffer::*;
pub use checksum::*;
pub use compress::*;
pub use encoding::*;
pub use error::*;
pub use view::*;
