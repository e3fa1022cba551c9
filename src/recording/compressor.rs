// src/recording/compressor.rs
//! zstd codec for sample arrays
//!
//! Arrays are stored as little-endian `i16` bytes, compressed as one zstd
//! frame per array. The codec is lossless.

use crate::utils::errors::{Result, TapeError};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Sample array compressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    /// Compress a slice of samples
    pub fn compress_samples(&self, samples: &[i16]) -> Result<Vec<u8>> {
        let raw: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let compressed = zstd::encode_all(raw.as_slice(), self.level.as_i32()).map_err(|e| {
            TapeError::CompressionFailed(format!("Compression error: {}", e))
        })?;

        trace!(
            "Compressed {} samples: {} -> {} bytes",
            samples.len(),
            raw.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decompress samples, checking the expected count
    pub fn decompress_samples(&self, data: &[u8], expected: usize) -> Result<Vec<i16>> {
        let raw = zstd::decode_all(data).map_err(|e| {
            TapeError::CompressionFailed(format!("Decompression error: {}", e))
        })?;

        if raw.len() != expected * 2 {
            return Err(TapeError::CompressionFailed(format!(
                "Expected {} samples, frame holds {} bytes",
                expected,
                raw.len()
            )));
        }

        Ok(raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionLevel::Balanced)
    }
}
