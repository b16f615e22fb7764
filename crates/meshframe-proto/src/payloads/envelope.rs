//! The `encrypted-ratchet` envelope and its associated-data binding.

use serde::{Deserialize, Serialize};

/// Logical type of the message sealed inside an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalType {
    /// New chat message
    Message,
    /// Edit of an earlier message
    EditMessage,
    /// Deletion of an earlier message
    DeleteMessage,
    /// Read receipt
    Read,
    /// Session priming from the ratchet initiator
    RatchetInit,
}

impl LogicalType {
    /// Wire name, as used in the `type` tag and the associated data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditMessage => "edit-message",
            Self::DeleteMessage => "delete-message",
            Self::Read => "read",
            Self::RatchetInit => "ratchet-init",
        }
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ratchet header as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    /// Sender ratchet public key
    pub dh: [u8; 32],
    /// Previous chain length
    pub pn: u32,
    /// Message number
    pub n: u32,
}

/// Sealed body of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetPayload {
    /// Ratchet header
    pub header: WireHeader,
    /// Ciphertext with tag
    pub ciphertext: Vec<u8>,
    /// 24-byte nonce
    pub iv: [u8; 24],
}

/// `encrypted-ratchet` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetEnvelope {
    /// Sealed content
    pub payload: RatchetPayload,
    /// Connection identifier of the sender
    pub sender_id: String,
    /// Type of the sealed message; also bound into the associated data
    pub original_type: LogicalType,
}

/// Build the associated-data string binding an envelope to its context.
///
/// Format: `session:<sessionId>|sender:<senderId>|recipient:<recipientId>|type:<logicalType>`.
pub fn associated_data(
    session_id: &str,
    sender_id: &str,
    recipient_id: &str,
    logical_type: LogicalType,
) -> String {
    format!("session:{session_id}|sender:{sender_id}|recipient:{recipient_id}|type:{logical_type}")
}
