//! Error types for ratchet sessions and attachment encryption.

use thiserror::Error;

/// Errors produced by a [`crate::RatchetSession`].
///
/// None of these are ever reported back to the remote peer. Callers log them
/// and drop the offending message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// Encrypt attempted before a send chain exists
    #[error("no send chain: handshake has not completed")]
    UninitializedChain,

    /// Decrypt attempted on a chain this session has not derived yet
    #[error("no receive chain for the message's ratchet key")]
    MissingChain,

    /// AEAD tag mismatch (tampered, replayed under other context, or wrong key)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Message index is behind the receive counter and no key was cached
    #[error("message {requested} is behind receive counter {current}")]
    OutOfOrder {
        /// Current receive counter
        current: u32,
        /// Index declared in the message header
        requested: u32,
    },

    /// Message index is too far ahead of the receive counter
    #[error("message {requested} skips too far ahead of receive counter {current}")]
    SkipLimitExceeded {
        /// Current receive counter
        current: u32,
        /// Index declared in the message header
        requested: u32,
    },

    /// Session was terminated and rejects further operations
    #[error("session terminated")]
    Terminated,

    /// Send counter reached `u32::MAX`
    #[error("message counter overflow")]
    CounterOverflow,
}

impl RatchetError {
    /// Returns true if the error is caused by message ordering rather than
    /// key material, so a later message on the same session may still work.
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::OutOfOrder { .. } | Self::SkipLimitExceeded { .. })
    }
}

/// Errors produced while sealing, opening or splitting attachments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    /// Blob is shorter than nonce plus tag
    #[error("attachment ciphertext truncated: {len} bytes")]
    Truncated {
        /// Length of the received blob
        len: usize,
    },

    /// Tag mismatch or wrong attachment key
    #[error("attachment authentication failed")]
    AuthenticationFailed,

    /// Chunk size of zero
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
}
