//! LZ4 transport compression
//!
//! Transactions above the compression threshold are compressed before
//! fragmentation so fewer BLE frames cross the mesh. Compressed payloads
//! carry an `LZ4` marker plus the original length so any hop can detect and
//! undo the compression before RPC submission.

use thiserror::Error;

/// Marker prefix on compressed payloads
const LZ4_MAGIC: &[u8] = b"LZ4";

/// Marker plus little-endian u32 original length
const LZ4_HEADER_LEN: usize = 7;

/// Compress `data`, prefixing the result with the marker and original size
pub fn compress(data: &[u8]) -> Result<Vec<u8>, Lz4Error> {
    let compressed = lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), false)
        .map_err(|e| Lz4Error::CompressionFailed(e.to_string()))?;

    let mut framed = Vec::with_capacity(LZ4_HEADER_LEN + compressed.len());
    framed.extend_from_slice(LZ4_MAGIC);
    framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
    framed.extend_from_slice(&compressed);

    tracing::debug!(
        "lz4: {} -> {} bytes ({:.1}% of original)",
        data.len(),
        framed.len(),
        framed.len() as f64 * 100.0 / data.len().max(1) as f64
    );

    Ok(framed)
}

/// True when `data` carries the compression marker
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= LZ4_HEADER_LEN && data.starts_with(LZ4_MAGIC)
}

/// Decompress marker-framed data back to the original bytes
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, Lz4Error> {
    if !is_compressed(data) {
        return Err(Lz4Error::InvalidData("missing LZ4 marker".into()));
    }

    let original_len = u32::from_le_bytes([data[3], data[4], data[5], data[6]]) as usize;
    let decompressed = lz4::block::decompress(&data[LZ4_HEADER_LEN..], Some(original_len as i32))
        .map_err(|e| Lz4Error::DecompressionFailed(e.to_string()))?;

    if decompressed.len() != original_len {
        return Err(Lz4Error::InvalidData(format!(
            "decompressed to {} bytes, header claimed {}",
            decompressed.len(),
            original_len
        )));
    }

    Ok(decompressed)
}

/// Undo compression when present, pass raw bytes through otherwise
pub fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>, Lz4Error> {
    if is_compressed(data) {
        decompress(data)
    } else {
        Ok(data.to_vec())
    }
}

/// Compression errors
#[derive(Debug, Clone, Error)]
pub enum Lz4Error {
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("invalid compressed data: {0}")]
    InvalidData(String),
}
