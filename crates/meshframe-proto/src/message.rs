//! The top-level tagged union and its CBOR codec.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    payloads::{
        chat::{ChatMessage, FileChunk, MessageRef},
        control::{Heartbeat, Hello, MemberUpdate, PeerList},
        envelope::{LogicalType, RatchetEnvelope},
    },
};

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Every message exchanged over a mesh link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Handshake on link open
    Hello(Hello),
    /// Gossip of known peers
    PeerList(PeerList),
    /// Presence / profile patch
    MemberUpdate(MemberUpdate),
    /// Liveness ping
    Ping(Heartbeat),
    /// Liveness reply
    Pong(Heartbeat),
    /// Ratchet-encrypted user message
    EncryptedRatchet(RatchetEnvelope),
    /// Session priming; only valid inside an envelope
    RatchetInit,
    /// Chat message; only valid inside an envelope
    Message(ChatMessage),
    /// Chat message edit; only valid inside an envelope
    EditMessage(ChatMessage),
    /// Message deletion; only valid inside an envelope
    DeleteMessage(MessageRef),
    /// Read receipt; only valid inside an envelope
    Read(MessageRef),
    /// Pre-encrypted attachment chunk
    FileChunk(FileChunk),
}

/// Routing class of a [`WireMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Clear-text mesh control
    Control,
    /// Encryption envelope
    Envelope,
    /// User message that must be encrypted
    User,
    /// Attachment chunk
    Chunk,
}

impl WireMessage {
    /// Routing class of this message.
    pub fn class(&self) -> MessageClass {
        match self {
            Self::Hello(_)
            | Self::PeerList(_)
            | Self::MemberUpdate(_)
            | Self::Ping(_)
            | Self::Pong(_) => MessageClass::Control,
            Self::EncryptedRatchet(_) => MessageClass::Envelope,
            Self::RatchetInit
            | Self::Message(_)
            | Self::EditMessage(_)
            | Self::DeleteMessage(_)
            | Self::Read(_) => MessageClass::User,
            Self::FileChunk(_) => MessageClass::Chunk,
        }
    }

    /// Logical type for user messages, `None` for everything else.
    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Self::RatchetInit => Some(LogicalType::RatchetInit),
            Self::Message(_) => Some(LogicalType::Message),
            Self::EditMessage(_) => Some(LogicalType::EditMessage),
            Self::DeleteMessage(_) => Some(LogicalType::DeleteMessage),
            Self::Read(_) => Some(LogicalType::Read),
            Self::Hello(_)
            | Self::PeerList(_)
            | Self::MemberUpdate(_)
            | Self::Ping(_)
            | Self::Pong(_)
            | Self::EncryptedRatchet(_)
            | Self::FileChunk(_) => None,
        }
    }

    /// Wire name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::PeerList(_) => "peer-list",
            Self::MemberUpdate(_) => "member-update",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::EncryptedRatchet(_) => "encrypted-ratchet",
            Self::FileChunk(_) => "file-chunk",
            Self::RatchetInit
            | Self::Message(_)
            | Self::EditMessage(_)
            | Self::DeleteMessage(_)
            | Self::Read(_) => self.logical_type().map_or("", LogicalType::as_str),
        }
    }

    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - `CborEncode` if serialization fails
    /// - `FrameTooLarge` if the result exceeds [`MAX_FRAME_SIZE`]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
        }
        Ok(bytes)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `FrameTooLarge` if `bytes` exceeds [`MAX_FRAME_SIZE`]
    /// - `CborDecode` on malformed input or unknown `type`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
        }
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}
