use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("range out of bounds: offset {offset} size {size} in buffer of {len} bytes")]
    OutOfBounds { offset: u64, size: u64, len: u64 },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("buffer loader error: {0}")]
    Loader(String),
}
