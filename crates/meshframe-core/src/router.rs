//! Inbound frame routing.
//!
//! Classifies a decoded frame and unwraps at most one encryption envelope.
//! The unwrap is an explicit loop with a depth check, not recursion: a frame
//! is decoded, an envelope is opened once, and the inner message is
//! classified exactly like a clear frame would be.
//!
//! Runs inside the caller's per-peer serialized queue, so `open` may mutate
//! the peer's ratchet session.

use meshframe_proto::{FileChunk, LogicalType, RatchetEnvelope, WireMessage};

use crate::error::{RouteError, SessionError};

/// Where an inbound frame goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Mesh control for the coordinator
    Control(WireMessage),
    /// Decrypted user message (including `ratchet-init`)
    User {
        /// The inner message
        message: WireMessage,
        /// Its logical type, as declared by the envelope
        logical_type: LogicalType,
    },
    /// Attachment chunk for the reassembler
    Chunk(FileChunk),
}

/// Decode and classify one inbound frame.
///
/// `open` decrypts an envelope with the sending peer's session.
///
/// # Errors
///
/// - `Protocol` if the frame or the decrypted payload does not decode
/// - `Session` if the envelope does not open
/// - `NestedEnvelope` if the decrypted payload is another envelope
/// - `TypeMismatch` if the inner type differs from `originalType`
/// - `PlaintextUserMessage` for a user message outside an envelope
pub fn route_inbound<F>(frame: &[u8], mut open: F) -> Result<Routed, RouteError>
where
    F: FnMut(&RatchetEnvelope) -> Result<Vec<u8>, SessionError>,
{
    let mut message = WireMessage::decode(frame)?;
    let mut declared = None;

    loop {
        let WireMessage::EncryptedRatchet(envelope) = &message else {
            return classify(message, declared);
        };
        if declared.is_some() {
            return Err(RouteError::NestedEnvelope);
        }

        let plaintext = open(envelope)?;
        declared = Some(envelope.original_type);
        message = WireMessage::decode(&plaintext)?;
    }
}

fn classify(message: WireMessage, declared: Option<LogicalType>) -> Result<Routed, RouteError> {
    match (declared, message.logical_type()) {
        (Some(declared), Some(actual)) if declared == actual => {
            Ok(Routed::User { message, logical_type: actual })
        },
        (Some(declared), _) => {
            Err(RouteError::TypeMismatch { declared, actual: message.type_name() })
        },
        (None, Some(_)) => Err(RouteError::PlaintextUserMessage(message.type_name())),
        (None, None) => match message {
            WireMessage::FileChunk(chunk) => Ok(Routed::Chunk(chunk)),
            other => Ok(Routed::Control(other)),
        },
    }
}
