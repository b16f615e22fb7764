//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeds [`crate::MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed (malformed or unknown message type)
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}
