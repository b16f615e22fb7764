//! Error types for the Meshframe core.
//!
//! Strongly-typed errors per layer: link lifecycle, peer sessions, chunk
//! reassembly and inbound routing. Outcomes that are not failures (a session
//! that still needs a handshake, a deferred send) are modelled as enums
//! elsewhere rather than as errors.

use std::time::Duration;

use meshframe_crypto::{AttachmentError, RatchetError};
use meshframe_proto::{LogicalType, ProtocolError};
use thiserror::Error;

/// Errors on a mesh link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Link did not open within its open timeout
    #[error("open timeout after {elapsed:?}")]
    OpenTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Underlying transport reported an error
    #[error("transport error: {0}")]
    Transport(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },
}

impl ConnectionError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OpenTimeout { .. } | Self::Transport(_))
    }
}

/// Errors from the session registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No ratchet session exists for the peer
    #[error("no session for peer {peer_id}")]
    MissingSession {
        /// Peer connection identifier
        peer_id: String,
    },

    /// The remote user's public key could not be obtained
    #[error("no public key available for user {user_id}")]
    KeyMaterialUnavailable {
        /// Remote user identifier
        user_id: String,
    },

    /// Ratchet operation failed
    #[error("ratchet: {0}")]
    Ratchet(#[from] RatchetError),
}

/// Errors while buffering or completing a chunked transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Chunk index not below the declared total
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Chunk index
        index: u32,
        /// Declared total
        total: u32,
    },

    /// Chunk or reference disagrees with the total already recorded
    #[error("total chunk count changed from {expected} to {actual}")]
    TotalMismatch {
        /// Total recorded for the file
        expected: u32,
        /// Total in the new chunk or reference
        actual: u32,
    },

    /// Declared total is zero or above the limit
    #[error("invalid chunk total {total} (max {max})")]
    InvalidTotal {
        /// Declared total
        total: u32,
        /// Allowed maximum
        max: u32,
    },

    /// Too many files are being reassembled at once for this peer
    #[error("too many pending transfers (max {max})")]
    TooManyPending {
        /// Allowed maximum
        max: usize,
    },

    /// Buffered chunks of one file exceed the byte limit
    #[error("transfer exceeds {max} bytes")]
    TransferTooLarge {
        /// Allowed maximum
        max: usize,
    },

    /// Reassembled blob failed to decrypt
    #[error("attachment: {0}")]
    Attachment(#[from] AttachmentError),
}

/// Errors while routing an inbound frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Frame or inner payload failed to decode
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Envelope could not be opened
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// An envelope was found inside an envelope
    #[error("nested encryption envelope")]
    NestedEnvelope,

    /// Inner message type differs from the envelope's declared type
    #[error("envelope declared {declared} but contained {actual}")]
    TypeMismatch {
        /// `originalType` on the envelope
        declared: LogicalType,
        /// Type tag of the decrypted message
        actual: &'static str,
    },

    /// A user message arrived outside an envelope
    #[error("plaintext {0} rejected")]
    PlaintextUserMessage(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_transport_errors_are_transient() {
        assert!(ConnectionError::OpenTimeout { elapsed: Duration::from_secs(31) }.is_transient());
        assert!(ConnectionError::Transport("reset".to_string()).is_transient());
        assert!(!ConnectionError::RetriesExhausted { attempts: 5 }.is_transient());
    }

    #[test]
    fn ratchet_errors_convert_into_session_errors() {
        let err: SessionError = RatchetError::AuthenticationFailed.into();
        assert_eq!(err, SessionError::Ratchet(RatchetError::AuthenticationFailed));
    }
}
