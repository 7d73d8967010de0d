//! Block compression for buffer payloads.
//!
//! The decompressed size is never stored in the compressed stream; callers
//! carry it out of band (the buffer tables record both sizes).

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::error::BufferError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    /// Explicit pass-through.
    #[default]
    None = 0,
    Lz4 = 1,
    /// High-compression LZ4; shares the LZ4 wire format, so it only differs
    /// on the encode side.
    Lz4Hc = 2,
    Zlib = 3,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<CompressionType> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            2 => Some(CompressionType::Lz4Hc),
            3 => Some(CompressionType::Zlib),
            _ => None,
        }
    }
}

/// Compresses `data` with the given codec.
pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>, BufferError> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 | CompressionType::Lz4Hc => Ok(lz4_flex::block::compress(data)),
        CompressionType::Zlib => {
            let level = Compression::best();
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| BufferError::Compression(format!("zlib: {e}")))
        }
    }
}

/// Decompresses `data`; `uncompressed_size` comes from the caller's
/// metadata and is validated against the actual output.
pub fn decompress(
    data: &[u8],
    compression: CompressionType,
    uncompressed_size: usize,
) -> Result<Vec<u8>, BufferError> {
    let out = match compression {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            lz4_flex::block::decompress(data, uncompressed_size)
                .map_err(|e| BufferError::Decompression(format!("lz4: {e}")))?
        }
        CompressionType::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::with_capacity(uncompressed_size));
            decoder
                .write_all(data)
                .and_then(|_| decoder.finish())
                .map_err(|e| BufferError::Decompression(format!("zlib: {e}")))?
        }
    };
    if out.len() != uncompressed_size {
        return Err(BufferError::Decompression(format!(
            "decompressed size mismatch: got {} bytes, expected {}",
            out.len(),
            uncompressed_size
        )));
    }
    Ok(out)
}

/// Worst-case output size for `len` input bytes.
pub fn estimate_compressed_size(compression: CompressionType, len: usize) -> usize {
    match compression {
        CompressionType::None => len,
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            lz4_flex::block::get_maximum_output_size(len)
        }
        // zlib compressBound: stored-block overhead plus header and adler
        CompressionType::Zlib => len + len / 1000 + (len / 16_384 + 1) * 5 + 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionType; 4] = [
        CompressionType::None,
        CompressionType::Lz4,
        CompressionType::Lz4Hc,
        CompressionType::Zlib,
    ];

    #[test]
    fn test_roundtrip_all_codecs() {
        let samples: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"abc".to_vec(),
            vec![0u8; 4096],
            (0..=255u8).cycle().take(10_000).collect(),
        ];
        for data in &samples {
            for ct in ALL {
                let packed = compress(data, ct).unwrap();
                let unpacked = decompress(&packed, ct, data.len()).unwrap();
                assert_eq!(&unpacked, data, "{ct:?} roundtrip failed");
            }
        }
    }

    #[test]
    fn test_compressible_data_shrinks() {
        let data = vec![7u8; 64 * 1024];
        for ct in [CompressionType::Lz4, CompressionType::Lz4Hc, CompressionType::Zlib] {
            let packed = compress(&data, ct).unwrap();
            assert!(packed.len() < data.len() / 2, "{ct:?} did not compress");
        }
    }

    #[test]
    fn test_random_roundtrips() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0DEC);
        for _ in 0..20 {
            let len = rng.gen_range(0..10_000);
            let data: Vec<u8> = (0..len).map(|_| rng.gen_range(0..16u8)).collect();
            for ct in ALL {
                let packed = compress(&data, ct).unwrap();
                assert_eq!(decompress(&packed, ct, data.len()).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = b"some payload to compress".repeat(16);
        let packed = compress(&data, CompressionType::Lz4).unwrap();
        assert!(decompress(&packed, CompressionType::Lz4, data.len() + 1).is_err());
    }

    #[test]
    fn test_estimate_covers_worst_case() {
        for ct in ALL {
            let data: Vec<u8> = (0..1024u32).map(|i| (i * 2654435761) as u8).collect();
            let packed = compress(&data, ct).unwrap();
            assert!(packed.len() <= estimate_compressed_size(ct, data.len()));
        }
    }
}
