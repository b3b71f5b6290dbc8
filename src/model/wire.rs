//! Length-delimited, schema-evolvable binary record framing.
//!
//! Encoding is `bincode` over the `serde`-derived message struct with a
//! trailing CRC32 integrity checksum.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::CoreError;

/// Encode a message to its wire representation: `bincode(payload) ||
/// crc32(bincode(payload))`, as a little-endian u32 trailer.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let mut buf =
        bincode::serialize(value).map_err(|e| CoreError::Internal(format!("encode: {e}")))?;
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Decode a wire payload produced by [`encode`], verifying the trailing
/// checksum before deserializing.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    if bytes.len() < 4 {
        return Err(CoreError::Internal("wire payload too short".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes(trailer.try_into().unwrap());
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(CoreError::Internal(format!(
            "wire checksum mismatch: expected {expected}, got {actual}"
        )));
    }
    bincode::deserialize(body).map_err(|e| CoreError::Internal(format!("decode: {e}")))
}
