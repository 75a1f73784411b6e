//! Serialization and deserialization for the relaywire wire protocol.
//!
//! Frames are encoded with postcard. Each encoded frame travels as one
//! WebSocket binary message, so no additional length prefix is needed, but
//! every frame is bounded by [`MAX_FRAME_SIZE`] in both directions.

use crate::frame::{DirectPayload, Frame};

/// Largest encoded frame accepted or produced (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes a [`Frame`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized, or
/// `CodecError::FrameTooLarge` if the result exceeds [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let bytes =
        postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decodes a [`Frame`] from a byte slice using postcard.
///
/// The size bound is checked before any parsing happens.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for oversized input, or
/// `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    check_size(bytes.len())?;
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes the plaintext of an encrypted envelope.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be serialized.
pub fn encode_direct(payload: &DirectPayload) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes the plaintext of an encrypted envelope.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid payload.
pub fn decode_direct(bytes: &[u8]) -> Result<DirectPayload, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

const fn check_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
