//! Deferred buffer loaders.
//!
//! Large payloads are stored out of line and fetched on demand through an
//! [`AsyncBufferLoader`]. A loader's wire identity is the CRC-64 of its
//! uncompressed content; loaders with equal CRC are interchangeable and the
//! save path deduplicates on it. Non-resident loaders may block inside
//! `load`/`extract` while the backing storage is fetched.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::warn;

use crate::buffer::Buffer;
use crate::checksum::crc64;
use crate::compress::{compress, decompress, CompressionType};
use crate::error::BufferError;

/// Minimum payload size worth spending compression time on.
const COMPRESSION_MIN_SIZE: usize = 512;

/// A buffer whose content is fetched on demand.
pub trait AsyncBufferLoader: Send + Sync {
    /// Uncompressed content size.
    fn size(&self) -> u64;

    /// CRC-64 of the uncompressed content; the buffer's wire identity.
    fn crc(&self) -> u64;

    /// True when `load` will not block.
    fn resident(&self) -> bool;

    /// Returns the compressed form for saving, compressing lazily if needed.
    fn extract(&self) -> Result<(Buffer, CompressionType), BufferError>;

    /// Returns the uncompressed content, decompressing lazily if needed.
    fn load(&self) -> Result<Buffer, BufferError>;

    /// Fast path: the uncompressed content when it is already in memory.
    fn peek(&self) -> Option<Buffer> {
        None
    }
}

pub type AsyncBufferRef = Arc<dyn AsyncBufferLoader>;

/// Resident buffer that starts uncompressed; the compressed form is
/// computed once on the first `extract`. When compression does not beat 90%
/// of the input size the uncompressed form is kept and that outcome is
/// remembered.
pub struct ResidentUncompressedBuffer {
    crc: u64,
    intended: CompressionType,
    uncompressed: Buffer,
    extracted: Mutex<Option<(Buffer, CompressionType)>>,
}

impl ResidentUncompressedBuffer {
    pub fn new(uncompressed: Buffer, intended: CompressionType) -> Arc<Self> {
        let crc = crc64(uncompressed.data());
        Arc::new(ResidentUncompressedBuffer {
            crc,
            intended,
            uncompressed,
            extracted: Mutex::new(None),
        })
    }

    /// Same as [`new`](Self::new) but trusts a precomputed CRC.
    pub fn with_known_crc(uncompressed: Buffer, intended: CompressionType, crc: u64) -> Arc<Self> {
        Arc::new(ResidentUncompressedBuffer {
            crc,
            intended,
            uncompressed,
            extracted: Mutex::new(None),
        })
    }
}

impl AsyncBufferLoader for ResidentUncompressedBuffer {
    fn size(&self) -> u64 {
        self.uncompressed.len() as u64
    }

    fn crc(&self) -> u64 {
        self.crc
    }

    fn resident(&self) -> bool {
        true
    }

    fn extract(&self) -> Result<(Buffer, CompressionType), BufferError> {
        if self.uncompressed.is_empty() {
            return Ok((Buffer::new(), CompressionType::None));
        }

        let mut slot = self.extracted.lock().expect("extract lock poisoned");
        if let Some((buffer, ct)) = slot.as_ref() {
            return Ok((buffer.clone(), *ct));
        }

        let mut result = None;
        if self.uncompressed.len() > COMPRESSION_MIN_SIZE
            && self.intended != CompressionType::None
        {
            let packed = compress(self.uncompressed.data(), self.intended)?;
            // keep the compressed form only when it actually pays off
            let cutoff = (self.uncompressed.len() * 9) / 10;
            if packed.len() < cutoff {
                result = Some((Buffer::from_vec(packed), self.intended));
            }
        }

        let outcome =
            result.unwrap_or_else(|| (self.uncompressed.clone(), CompressionType::None));
        *slot = Some(outcome.clone());
        Ok(outcome)
    }

    fn load(&self) -> Result<Buffer, BufferError> {
        Ok(self.uncompressed.clone())
    }

    fn peek(&self) -> Option<Buffer> {
        Some(self.uncompressed.clone())
    }
}

/// Resident buffer holding the compressed form; decompressed at most once,
/// on the first `load`.
pub struct ResidentCompressedBuffer {
    crc: u64,
    uncompressed_size: u64,
    compression: CompressionType,
    compressed: Buffer,
    loaded: Mutex<Option<Buffer>>,
}

impl ResidentCompressedBuffer {
    pub fn new(
        compressed: Buffer,
        compression: CompressionType,
        uncompressed_size: u64,
        crc: u64,
    ) -> Arc<Self> {
        Arc::new(ResidentCompressedBuffer {
            crc,
            uncompressed_size,
            compression,
            compressed,
            loaded: Mutex::new(None),
        })
    }
}

impl AsyncBufferLoader for ResidentCompressedBuffer {
    fn size(&self) -> u64 {
        self.uncompressed_size
    }

    fn crc(&self) -> u64 {
        self.crc
    }

    fn resident(&self) -> bool {
        true
    }

    fn extract(&self) -> Result<(Buffer, CompressionType), BufferError> {
        Ok((self.compressed.clone(), self.compression))
    }

    fn load(&self) -> Result<Buffer, BufferError> {
        if self.compression == CompressionType::None {
            return Ok(self.compressed.clone());
        }

        let mut slot = self.loaded.lock().expect("load lock poisoned");
        if let Some(buffer) = slot.as_ref() {
            return Ok(buffer.clone());
        }

        let raw = decompress(
            self.compressed.data(),
            self.compression,
            self.uncompressed_size as usize,
        )?;
        let buffer = Buffer::from_vec(raw);
        if crc64(buffer.data()) != self.crc {
            warn!(crc = self.crc, "buffer content does not match its recorded checksum");
            return Err(BufferError::Loader(format!(
                "buffer {:#018x} failed its checksum after decompression",
                self.crc
            )));
        }
        *slot = Some(buffer.clone());
        Ok(buffer)
    }

    fn peek(&self) -> Option<Buffer> {
        if self.compression == CompressionType::None {
            return Some(self.compressed.clone());
        }
        self.loaded.lock().expect("load lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_small_payload_stays_raw() {
        // under the size threshold, extract keeps the raw bytes
        let loader = ResidentUncompressedBuffer::new(
            Buffer::from_slice(b"tiny"),
            CompressionType::Lz4,
        );
        let (data, ct) = loader.extract().unwrap();
        assert_eq!(ct, CompressionType::None);
        assert_eq!(data.data(), b"tiny");
    }

    #[test]
    fn test_uncompressed_compressible_payload() {
        let raw = vec![42u8; 16 * 1024];
        let loader =
            ResidentUncompressedBuffer::new(Buffer::from_vec(raw.clone()), CompressionType::Lz4);
        let (packed, ct) = loader.extract().unwrap();
        assert_eq!(ct, CompressionType::Lz4);
        assert!(packed.len() < raw.len() / 2);

        // outcome is memoised
        let (packed2, ct2) = loader.extract().unwrap();
        assert_eq!(ct2, ct);
        assert_eq!(packed2, packed);

        assert_eq!(loader.load().unwrap().data(), &raw[..]);
        assert_eq!(loader.size(), raw.len() as u64);
    }

    #[test]
    fn test_incompressible_payload_falls_back() {
        // pseudo-random bytes do not beat the 90% cutoff
        let raw: Vec<u8> = (0u32..4096)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let loader =
            ResidentUncompressedBuffer::new(Buffer::from_vec(raw.clone()), CompressionType::Lz4);
        let (data, ct) = loader.extract().unwrap();
        assert_eq!(ct, CompressionType::None);
        assert_eq!(data.data(), &raw[..]);
    }

    #[test]
    fn test_compressed_roundtrip_and_memoisation() {
        let raw = vec![7u8; 8192];
        let packed = compress(&raw, CompressionType::Zlib).unwrap();
        let loader = ResidentCompressedBuffer::new(
            Buffer::from_vec(packed),
            CompressionType::Zlib,
            raw.len() as u64,
            crc64(&raw),
        );

        assert!(loader.peek().is_none());
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.data(), &raw[..]);
        assert!(loader.peek().is_some());
    }

    #[test]
    fn test_compressed_checksum_mismatch() {
        let raw = vec![7u8; 1024];
        let packed = compress(&raw, CompressionType::Lz4).unwrap();
        let loader = ResidentCompressedBuffer::new(
            Buffer::from_vec(packed),
            CompressionType::Lz4,
            raw.len() as u64,
            0xDEAD_BEEF, // wrong on purpose
        );
        assert!(loader.load().is_err());
    }

    #[test]
    fn test_identity_is_content_crc() {
        let a = ResidentUncompressedBuffer::new(Buffer::from_slice(b"abc"), CompressionType::None);
        let b = ResidentUncompressedBuffer::new(Buffer::from_slice(b"abc"), CompressionType::Lz4);
        assert_eq!(a.crc(), b.crc());
        assert_eq!(a.crc(), crc64(b"abc"));
    }
}
