//! Key directory: user id → long-term public key.
//!
//! The directory is an external service. Nodes publish their identity key on
//! start and look up a remote user's key before establishing a session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use meshframe_crypto::PUBLIC_KEY_SIZE;

/// Publication and lookup of identity keys.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish (or replace) `user_id`'s public key.
    async fn publish(&self, user_id: &str, public_key: [u8; PUBLIC_KEY_SIZE]);

    /// Look up `user_id`'s public key.
    async fn lookup(&self, user_id: &str) -> Option<[u8; PUBLIC_KEY_SIZE]>;
}

/// In-process directory shared by clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    keys: Arc<Mutex<HashMap<String, [u8; PUBLIC_KEY_SIZE]>>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget `user_id`'s key.
    pub fn revoke(&self, user_id: &str) -> bool {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(user_id).is_some()
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn publish(&self, user_id: &str, public_key: [u8; PUBLIC_KEY_SIZE]) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), public_key);
    }

    async fn lookup(&self, user_id: &str) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).get(user_id).copied()
    }
}
