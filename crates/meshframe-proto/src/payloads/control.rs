//! Mesh control messages: handshake, gossip, presence and liveness.

use serde::{Deserialize, Serialize};

/// First message on every newly opened link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Display name
    pub name: String,
    /// Stable device identifier; survives reconnects under new link ids
    pub device_id: String,
    /// Account identifier, used to look up the long-term public key
    pub user_id: String,
}

/// Gossip of peer identifiers known to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    /// Peer connection identifiers
    pub peers: Vec<String>,
}

/// Presence of a mesh member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    /// Reachable and answering pings
    Online,
    /// Link closed or pings unanswered
    Offline,
}

/// Partial update of the sender's member entry. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPatch {
    /// New display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New presence status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    /// Typing indicator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
}

/// Member update broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    /// Fields to change on the sender's entry
    pub updates: MemberPatch,
}

/// Ping or pong body. A pong echoes the ping's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender wall clock at ping time, milliseconds since the Unix epoch
    pub timestamp: u64,
}
