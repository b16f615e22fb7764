//! Runtime error types.

use meshframe_crypto::AttachmentError;
use meshframe_proto::ProtocolError;
use thiserror::Error;

/// Errors from a transport channel or connector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Nobody is listening under the dialed identifier
    #[error("peer {0} unreachable")]
    Unreachable(String),

    /// The channel was closed by either side
    #[error("channel closed")]
    Closed,

    /// Any other transport failure
    #[error("transport failure: {0}")]
    Io(String),
}

/// Errors surfaced by [`crate::Node`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// Message could not be encoded
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Attachment could not be sealed or split
    #[error("attachment: {0}")]
    Attachment(#[from] AttachmentError),
}
