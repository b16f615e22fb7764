//! Runtime configuration.

use std::time::Duration;

use meshframe_core::{LocalPeer, MeshConfig};
use meshframe_crypto::{DEFAULT_CHUNK_SIZE, IdentityKeyPair};

/// Outstanding bytes on a channel above which senders wait (1 MiB).
pub const DEFAULT_BACKPRESSURE_LIMIT: usize = 1024 * 1024;

/// How often a waiting sender re-checks the buffered amount.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Coordinator tick period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// User messages held per peer while its session is not ready.
pub const DEFAULT_MAX_BACKLOG: usize = 256;

/// Outbound send settings.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Wait while a channel has more than this many unsent bytes
    pub backpressure_limit: usize,
    /// Poll period while waiting
    pub poll_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backpressure_limit: DEFAULT_BACKPRESSURE_LIMIT,
            poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }
}

/// Configuration for one [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity announced in `hello`
    pub local: LocalPeer,
    /// Rendezvous peer to dial on start
    pub anchor: Option<String>,
    /// Mesh session identifier bound into every envelope
    pub session_id: String,
    /// Coordinator settings (timeouts, backoff, retries)
    pub mesh: MeshConfig,
    /// Outbound send settings
    pub broadcast: BroadcastConfig,
    /// Coordinator tick period
    pub tick_interval: Duration,
    /// Attachment chunk size in bytes
    pub chunk_size: usize,
    /// Deferred user messages per peer
    pub max_backlog: usize,
    /// Persisted long-term identity; a fresh one is generated when unset
    pub identity: Option<IdentityKeyPair>,
}

impl NodeConfig {
    /// Defaults for everything but identity and session.
    pub fn new(local: LocalPeer, session_id: impl Into<String>) -> Self {
        Self {
            local,
            anchor: None,
            session_id: session_id.into(),
            mesh: MeshConfig::default(),
            broadcast: BroadcastConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_backlog: DEFAULT_MAX_BACKLOG,
            identity: None,
        }
    }

    /// Join through `anchor`.
    #[must_use]
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = Some(anchor.into());
        self
    }

    /// Reuse a stored identity instead of generating one, so peers keep
    /// agreeing on the same secret across restarts.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityKeyPair) -> Self {
        self.identity = Some(identity);
        self
    }
}
