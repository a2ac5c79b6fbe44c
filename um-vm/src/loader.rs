//! Program image loading.
//!
//! An image is a stream of big-endian 32-bit words. The file length must
//! be a multiple of four bytes; anything else is a malformed image.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug)]
pub enum ImageError {
    /// Image length is not a multiple of four bytes.
    Truncated { len: usize },
    Io(io::Error),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Truncated { len } => {
                write!(f, "image length {len} is not a multiple of 4 bytes")
            }
            ImageError::Io(err) => write!(f, "failed to read image: {err}"),
        }
    }
}

impl Error for ImageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ImageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        ImageError::Io(err)
    }
}

/// Parse an in-memory image into instruction words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, ImageError> {
    if bytes.len() % 4 != 0 {
        return Err(ImageError::Truncated { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Read and parse an image file.
pub fn load_image(path: &Path) -> Result<Vec<u32>, ImageError> {
    let bytes = fs::read(path)?;
    words_from_bytes(&bytes)
}
