//! Member table learned from `hello` and `member-update`.
//!
//! Keyed by connection identifier. A device that reconnects under a new
//! connection identifier replaces its old entry instead of appearing twice.

use std::collections::BTreeMap;

use meshframe_proto::{Hello, MemberPatch, PresenceStatus};

/// One reachable (or recently reachable) participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Transient connection identifier
    pub connection_id: String,
    /// Stable device identifier
    pub device_id: String,
    /// Account identifier
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Presence
    pub status: PresenceStatus,
    /// Wall-clock milliseconds of the last status change or activity
    pub last_seen: u64,
    /// Typing indicator
    pub is_typing: bool,
}

/// Result of [`Roster::upsert_from_hello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// First time this device is seen
    Added,
    /// Same device under a new connection id; the old entry was removed
    Replaced {
        /// Connection id of the removed entry
        previous_connection_id: String,
    },
    /// Same connection id; fields refreshed
    Refreshed,
}

/// Members keyed by connection id.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: BTreeMap<String, Member>,
}

impl Roster {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or merge a member from its `hello`. The member is marked
    /// online.
    pub fn upsert_from_hello(&mut self, connection_id: &str, hello: &Hello, now_ms: u64) -> Upsert {
        let previous = self
            .members
            .values()
            .find(|m| m.device_id == hello.device_id && m.connection_id != connection_id)
            .map(|m| m.connection_id.clone());

        let outcome = match previous {
            Some(previous_connection_id) => {
                self.members.remove(&previous_connection_id);
                Upsert::Replaced { previous_connection_id }
            },
            None if self.members.contains_key(connection_id) => Upsert::Refreshed,
            None => Upsert::Added,
        };

        let is_typing = self.members.get(connection_id).is_some_and(|m| m.is_typing);
        self.members.insert(connection_id.to_string(), Member {
            connection_id: connection_id.to_string(),
            device_id: hello.device_id.clone(),
            user_id: hello.user_id.clone(),
            name: hello.name.clone(),
            status: PresenceStatus::Online,
            last_seen: now_ms,
            is_typing,
        });

        outcome
    }

    /// Set the status of a member. Returns the updated member if the status
    /// changed.
    pub fn set_status(
        &mut self,
        connection_id: &str,
        status: PresenceStatus,
        now_ms: u64,
    ) -> Option<&Member> {
        let member = self.members.get_mut(connection_id)?;
        if member.status == status {
            return None;
        }
        member.status = status;
        member.last_seen = now_ms;
        if status == PresenceStatus::Offline {
            member.is_typing = false;
        }
        Some(member)
    }

    /// Apply a `member-update` patch. Returns the member if it exists.
    pub fn apply_patch(
        &mut self,
        connection_id: &str,
        patch: &MemberPatch,
        now_ms: u64,
    ) -> Option<&Member> {
        let member = self.members.get_mut(connection_id)?;
        if let Some(name) = &patch.name {
            member.name.clone_from(name);
        }
        if let Some(status) = patch.status {
            member.status = status;
        }
        if let Some(is_typing) = patch.is_typing {
            member.is_typing = is_typing;
        }
        member.last_seen = now_ms;
        Some(member)
    }

    /// Member by connection id.
    pub fn get(&self, connection_id: &str) -> Option<&Member> {
        self.members.get(connection_id)
    }

    /// True if the connection id is in the roster.
    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Remove a member.
    pub fn remove(&mut self, connection_id: &str) -> Option<Member> {
        self.members.remove(connection_id)
    }

    /// All members in connection-id order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if no members are known.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
