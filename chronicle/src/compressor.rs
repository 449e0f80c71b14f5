//! Contains the optional byte-to-byte compression stage of the state
//! pipeline. When enabled together with a [`Cipher`][crate::cipher::Cipher],
//! compression always runs before encryption on write and after
//! decryption on read.

use std::fmt::Debug;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// An invertible byte-to-byte transform applied to serialized state
/// before it is recorded.
///
/// Implementations must be pure: `decompress(compress(x)) == x`.
pub trait Compressor: Send + Sync + Debug {
    /// Compresses the given bytes.
    fn compress(&self, data: &[u8]) -> Vec<u8>;

    /// Reverses [`compress`][Compressor::compress].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError>;
}

/// Error returned when recorded state cannot be decompressed,
/// typically because it was corrupted or written without compression.
#[derive(Debug, thiserror::Error)]
#[error("failed to decompress recorded state: {0}")]
pub struct DecompressionError(#[source] std::io::Error);

/// Default [`Compressor`] implementation using the zlib (DEFLATE) format.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    /// Returns a compressor using the given zlib level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .expect("writing to an in-memory zlib encoder should not fail");
        encoder
            .finish()
            .expect("finishing an in-memory zlib encoder should not fail")
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder.read_to_end(&mut out).map_err(DecompressionError)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_round_trips() {
        let compressor = ZlibCompressor::default();
        let body = b"the quick brown fox jumps over the lazy dog".repeat(32);

        let compressed = compressor.compress(&body);
        let decompressed = compressor
            .decompress(&compressed)
            .expect("decompression should not fail");

        assert_eq!(body, decompressed);
    }

    #[test]
    fn repetitive_bodies_shrink() {
        let compressor = ZlibCompressor::default();
        let body = b"aggregate state with much repetition ".repeat(256);

        let compressed = compressor.compress(&body);

        assert!(compressed.len() < body.len());
    }

    #[test]
    fn corrupted_data_fails_to_decompress() {
        let compressor = ZlibCompressor::default();

        let err = compressor.decompress(b"definitely not zlib");

        assert!(err.is_err());
    }
}
