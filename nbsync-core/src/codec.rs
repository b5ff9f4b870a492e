//! Binary wire codec.
//!
//! Wire format:
//! ```text
//! ┌───────────────────────────┬──────────────────────┐
//! │ bincode (standard config) │ FRAME_DELIMITER      │
//! │ variable                  │ 16 bytes             │
//! └───────────────────────────┴──────────────────────┘
//! ```
//!
//! The transport delivers one frame per send, so the delimiter is not used to
//! split a stream; it is a trailer that `decode_frame` checks and strips before
//! handing the body to bincode. A frame without it, or with bytes left over
//! after the body, is corrupt.
//!
//! Decode errors are fatal for the connection: once a frame is corrupt the
//! mirrored state can no longer be trusted.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Trailer appended to every encoded frame.
pub const FRAME_DELIMITER: &[u8] = b"\xFE\xED\xFA\xCE/nbsync/end\x00";

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Frame is missing the trailing delimiter")]
    MissingDelimiter,

    #[error("Decoded {consumed} of {total} bytes, frame has trailing garbage")]
    TrailingBytes { consumed: usize, total: usize },
}

/// Serialize a value to bincode bytes, without the delimiter.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize bincode bytes produced by [`encode`]. The whole slice must be consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, consumed) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            total: bytes.len(),
        });
    }
    Ok(value)
}

/// Encode a value and append [`FRAME_DELIMITER`].
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = encode(value)?;
    bytes.extend_from_slice(FRAME_DELIMITER);
    Ok(bytes)
}

/// Strip exactly one trailing [`FRAME_DELIMITER`] and decode the body.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    let body = frame
        .strip_suffix(FRAME_DELIMITER)
        .ok_or(CodecError::MissingDelimiter)?;
    decode(body)
}
