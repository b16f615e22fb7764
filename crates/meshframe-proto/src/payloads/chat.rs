//! User-facing chat payloads. Never sent outside an encryption envelope.

use serde::{Deserialize, Serialize};

/// Reference to an attachment sent as chunks.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    /// Identifier shared with the file's chunks
    pub file_id: String,
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// Number of chunks the sealed file was split into
    pub total_chunks: u32,
    /// Single-use attachment key
    pub key: [u8; 32],
}

impl std::fmt::Debug for AttachmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentRef")
            .field("file_id", &self.file_id)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("total_chunks", &self.total_chunks)
            .finish_non_exhaustive()
    }
}

/// A chat message, also used for edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique message identifier; edits reuse it
    pub id: String,
    /// Connection identifier of the author
    pub sender_id: String,
    /// Message text
    pub text: String,
    /// Author wall clock, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Identifier of the message replied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Attachments sent alongside this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Set on edits
    #[serde(default)]
    pub is_edited: bool,
    /// On edits: attachments of the original message that are kept
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub existing_file_ids: Vec<String>,
}

/// Points at an existing message (delete, read receipt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Target message identifier
    pub id: String,
}

/// One piece of a sealed attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    /// Attachment identifier
    pub file_id: String,
    /// Zero-based position
    pub chunk_index: u32,
    /// Total number of chunks
    pub total_chunks: u32,
    /// Ciphertext bytes
    pub data: Vec<u8>,
}
