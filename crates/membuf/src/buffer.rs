//! Refcounted byte storage.
//!
//! A [`Buffer`] is a window into shared, immutable storage. Sub-buffers
//! share the parent's allocation instead of copying; the allocation is
//! released when the last window referencing it is dropped.

use std::fmt;

use bytes::Bytes;

use crate::checksum::crc64;
use crate::error::BufferError;
use crate::view::BufferView;

/// Shared, immutable byte storage.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    /// Empty buffer with no storage attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `data` into a fresh allocation.
    pub fn from_slice(data: &[u8]) -> Self {
        Buffer {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Takes ownership of `data` without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Buffer { data: data.into() }
    }

    /// Wraps storage owned elsewhere; the backing memory is released when
    /// the last clone drops.
    pub fn from_bytes(data: Bytes) -> Self {
        Buffer { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Non-owning view of the buffer contents.
    pub fn view(&self) -> BufferView<'_> {
        BufferView::new(&self.data)
    }

    /// New buffer sharing this buffer's storage, windowed to
    /// `[offset, offset+size)`. No bytes are copied.
    pub fn create_sub_buffer(&self, offset: usize, size: usize) -> Result<Buffer, BufferError> {
        if offset.checked_add(size).map_or(true, |end| end > self.data.len()) {
            return Err(BufferError::OutOfBounds {
                offset: offset as u64,
                size: size as u64,
                len: self.data.len() as u64,
            });
        }
        Ok(Buffer {
            data: self.data.slice(offset..offset + size),
        })
    }

    /// Shrinks the reported size. The storage itself is untouched; growing
    /// is not allowed.
    pub fn adjust_size(&mut self, new_size: usize) -> Result<(), BufferError> {
        if new_size > self.data.len() {
            return Err(BufferError::OutOfBounds {
                offset: 0,
                size: new_size as u64,
                len: self.data.len() as u64,
            });
        }
        self.data.truncate(new_size);
        Ok(())
    }

    /// CRC-64 of the buffer contents, the wire identity used for buffer
    /// deduplication.
    pub fn crc64(&self) -> u64 {
        crc64(&self.data)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.data.len())
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer::from_slice(data)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from_vec(data)
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Buffer::from_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_buffer_shares_storage() {
        let buf = Buffer::from_slice(b"hello world");
        let sub = buf.create_sub_buffer(6, 5).unwrap();
        assert_eq!(sub.data(), b"world");
        // same allocation, different window
        assert_eq!(buf.data()[6..].as_ptr(), sub.data().as_ptr());
    }

    #[test]
    fn test_sub_buffer_out_of_bounds() {
        let buf = Buffer::from_slice(b"abc");
        assert!(buf.create_sub_buffer(2, 2).is_err());
        assert!(buf.create_sub_buffer(4, 0).is_err());
    }

    #[test]
    fn test_adjust_size_shrinks_only() {
        let mut buf = Buffer::from_slice(b"abcdef");
        buf.adjust_size(3).unwrap();
        assert_eq!(buf.data(), b"abc");
        assert!(buf.adjust_size(6).is_err());
    }

    #[test]
    fn test_equality_by_content() {
        let a = Buffer::from_slice(b"abc");
        let b = Buffer::from_vec(b"abc".to_vec());
        let c = Buffer::from_slice(b"abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_nested_sub_buffer() {
        let buf = Buffer::from_slice(b"0123456789");
        let sub = buf.create_sub_buffer(2, 6).unwrap();
        let subsub = sub.create_sub_buffer(1, 3).unwrap();
        assert_eq!(subsub.data(), b"345");
    }
}
