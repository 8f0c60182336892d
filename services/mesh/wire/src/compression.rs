//! Optional LZ4 payload compression.

use crate::header::MAX_PAYLOAD_SIZE;
use crate::WireError;

/// Payloads shorter than this are never compressed
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Compress `data` when it is large enough and the result is strictly smaller.
///
/// Returns `None` when the payload should be sent as-is.
pub fn compress_if_beneficial(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESSION_THRESHOLD {
        return None;
    }
    let compressed = lz4_flex::compress_prepend_size(data);
    (compressed.len() < data.len()).then_some(compressed)
}

/// Restore a payload produced by [`compress_if_beneficial`].
///
/// The little-endian size prefix is checked against [`MAX_PAYLOAD_SIZE`]
/// before anything is allocated.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() < 4 {
        return Err(WireError::Decompress("missing size prefix".to_string()));
    }
    let (prefix, body) = data.split_at(4);
    let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(WireError::Decompress(format!(
            "declared size {} exceeds {}",
            size, MAX_PAYLOAD_SIZE
        )));
    }
    lz4_flex::decompress(body, size).map_err(|e| WireError::Decompress(e.to_string()))
}
