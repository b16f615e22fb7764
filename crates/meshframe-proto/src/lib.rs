//! Meshframe wire protocol.
//!
//! Every frame on a mesh link is one [`WireMessage`]: a tagged union whose
//! `type` field names the variant (`hello`, `peer-list`, `encrypted-ratchet`,
//! ...), encoded as CBOR. Control messages travel in the clear. User messages
//! travel only inside an `encrypted-ratchet` envelope, and file chunks carry
//! bytes that were sealed before splitting.
//!
//! # Invariants
//!
//! - Decoding never panics on arbitrary input; oversized frames are rejected
//!   before parsing.
//! - The associated-data string for an envelope is a pure function of
//!   (session, sender, recipient, logical type), so both ends compute the same
//!   bytes without negotiation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
mod message;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use message::{MAX_FRAME_SIZE, MessageClass, WireMessage};
pub use payloads::{
    chat::{AttachmentRef, ChatMessage, FileChunk, MessageRef},
    control::{Heartbeat, Hello, MemberPatch, MemberUpdate, PeerList, PresenceStatus},
    envelope::{LogicalType, RatchetEnvelope, RatchetPayload, WireHeader, associated_data},
};
