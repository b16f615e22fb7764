//! Mesh coordinator.
//!
//! Keeps N direct links alive, learns membership through gossip and decides
//! when to dial, redial or give up. Pure state machine: the runtime feeds
//! [`MeshEvent`]s and executes the returned [`MeshAction`]s.
//!
//! # Protocol
//!
//! ```text
//!  A (new)                 B (anchor)               C (known to B)
//!    │── dial ───────────────>│                          │
//!    │<─────── hello ─────────│                          │
//!    │── hello ──────────────>│                          │
//!    │<── peer-list [C] ──────│── peer-list [A] ────────>│
//!    │── dial ───────────────────────────────────────────│
//! ```
//!
//! Every peer learned from a `peer-list` that is not connected is dialed.
//! When both sides dial each other at once, the link initiated by the
//! lexicographically greater identifier survives.
//!
//! # Failure
//!
//! Failed dials and open timeouts are retried with exponential backoff.
//! After `max_reinit_attempts` retries the peer is reported failed exactly
//! once and never retried automatically. A closed anchor link enters the same
//! backoff loop; other closed links are healed by the periodic
//! reconciliation pass, dialed by the tie-break winner.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    time::Duration,
};

use meshframe_proto::{Heartbeat, Hello, PeerList, PresenceStatus, WireMessage};

use crate::{
    backoff::{AnchorTimeoutSchedule, BackoffConfig, ReconnectBackoff},
    connection::{ConnectionAction, ConnectionConfig, ConnectionRecord, Direction, LinkId},
    env::Environment,
    error::ConnectionError,
    roster::{Member, Roster, Upsert},
};

/// Retries before a peer is reported as failed.
pub const DEFAULT_MAX_REINIT_ATTEMPTS: u32 = 5;

/// Tie-break: the lexicographically greater identifier initiates.
///
/// Both sides evaluating the rule for the same pair reach complementary
/// answers, so exactly one of them acts.
pub fn should_initiate(local: &str, remote: &str) -> bool {
    local > remote
}

/// Identity this device announces in `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    /// Connection identifier
    pub peer_id: String,
    /// Display name
    pub name: String,
    /// Stable device identifier
    pub device_id: String,
    /// Account identifier
    pub user_id: String,
}

impl LocalPeer {
    fn hello(&self) -> Hello {
        Hello {
            name: self.name.clone(),
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Per-link timeouts
    pub connection: ConnectionConfig,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// Open timeouts for anchor dials
    pub anchor_schedule: AnchorTimeoutSchedule,
    /// Retries before terminal failure
    pub max_reinit_attempts: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            anchor_schedule: AnchorTimeoutSchedule::default(),
            max_reinit_attempts: DEFAULT_MAX_REINIT_ATTEMPTS,
        }
    }
}

/// Connection status surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Dial in progress
    Connecting,
    /// Link open
    Connected,
    /// Link closed; a retry may follow
    Disconnected,
    /// Retries exhausted; no further automatic attempts
    Failed {
        /// Retries made before giving up
        retry_attempts: u32,
    },
}

/// Events fed to the coordinator by the runtime.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Begin: dial the anchor, if any
    Start,

    /// An outbound dial completed
    ConnectionOpened {
        /// Remote peer
        peer_id: String,
        /// Link from the matching [`MeshAction::Dial`]
        link: LinkId,
    },

    /// An outbound dial failed
    ConnectionFailed {
        /// Remote peer
        peer_id: String,
        /// Link from the matching [`MeshAction::Dial`]
        link: LinkId,
        /// Why
        error: ConnectionError,
    },

    /// A peer dialed us
    IncomingConnection {
        /// Remote peer
        peer_id: String,
        /// Link id from [`MeshCoordinator::allocate_link`]
        link: LinkId,
    },

    /// A link closed (either side, or transport error)
    ConnectionClosed {
        /// Remote peer
        peer_id: String,
        /// Closed link
        link: LinkId,
    },

    /// A control message arrived
    ControlReceived {
        /// Remote peer
        peer_id: String,
        /// Link it arrived on
        link: LinkId,
        /// The message
        message: WireMessage,
    },

    /// Periodic timer
    Tick,
}

/// Actions for the runtime to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshAction {
    /// Open a link
    Dial {
        /// Remote peer
        peer_id: String,
        /// Id to report back in the outcome event
        link: LinkId,
        /// Open deadline; the coordinator enforces it on [`MeshEvent::Tick`]
        open_timeout: Duration,
    },

    /// Send a message on the peer's current link
    Send {
        /// Remote peer
        peer_id: String,
        /// Message to send in the clear
        message: WireMessage,
    },

    /// Close (or abandon) a link
    CloseLink {
        /// Remote peer
        peer_id: String,
        /// Link to close
        link: LinkId,
        /// Diagnostic reason
        reason: String,
    },

    /// Look up the peer's public key and establish a ratchet session
    EstablishSession {
        /// Remote peer
        peer_id: String,
        /// Account whose key to look up
        user_id: String,
    },

    /// Tear down the peer's ratchet session and pending transfers
    DropSession {
        /// Remote peer
        peer_id: String,
    },

    /// Connection status changed
    StatusChanged {
        /// Remote peer
        peer_id: String,
        /// New status
        status: ConnectionStatus,
    },

    /// A roster entry was added or changed
    MemberChanged(Member),

    /// A retry was scheduled
    RetryScheduled {
        /// Remote peer
        peer_id: String,
        /// Retry number, starting at 1
        attempt: u32,
        /// Delay before the redial
        delay: Duration,
    },

    /// Terminal failure; emitted once per peer
    Failed {
        /// Remote peer
        peer_id: String,
        /// Final error
        error: ConnectionError,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingRedial<I> {
    scheduled_at: I,
    delay: Duration,
}

/// Mesh coordinator for one local device.
pub struct MeshCoordinator<E: Environment> {
    env: E,
    local: LocalPeer,
    anchor: Option<String>,
    config: MeshConfig,
    connections: BTreeMap<String, ConnectionRecord<E::Instant>>,
    roster: Roster,
    backoff: BTreeMap<String, ReconnectBackoff>,
    redials: BTreeMap<String, PendingRedial<E::Instant>>,
    /// Peers learned through gossip that we want links to
    discovered: BTreeSet<String>,
    /// Peers whose retries are exhausted
    failed: HashSet<String>,
    /// Connection ids replaced by a reconnect of the same device
    superseded: HashSet<String>,
    next_link: u64,
}

impl<E: Environment> MeshCoordinator<E> {
    /// Create a coordinator. `anchor` is the rendezvous peer dialed on
    /// [`MeshEvent::Start`].
    pub fn new(env: E, local: LocalPeer, anchor: Option<String>, config: MeshConfig) -> Self {
        let anchor = anchor.filter(|a| *a != local.peer_id);
        Self {
            env,
            local,
            anchor,
            config,
            connections: BTreeMap::new(),
            roster: Roster::new(),
            backoff: BTreeMap::new(),
            redials: BTreeMap::new(),
            discovered: BTreeSet::new(),
            failed: HashSet::new(),
            superseded: HashSet::new(),
            next_link: 1,
        }
    }

    /// Our identity.
    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    /// Member table.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Current link record for a peer.
    pub fn connection(&self, peer_id: &str) -> Option<&ConnectionRecord<E::Instant>> {
        self.connections.get(peer_id)
    }

    /// Peers with an open link.
    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.values().filter(|c| c.is_open()).map(|c| c.peer_id().to_string()).collect()
    }

    /// True if the peer's retries are exhausted.
    pub fn is_failed(&self, peer_id: &str) -> bool {
        self.failed.contains(peer_id)
    }

    /// True if a redial is scheduled for the peer.
    pub fn has_pending_redial(&self, peer_id: &str) -> bool {
        self.redials.contains_key(peer_id)
    }

    /// Fresh link id, for links accepted by the runtime.
    pub fn allocate_link(&mut self) -> LinkId {
        let link = LinkId(self.next_link);
        self.next_link += 1;
        link
    }

    /// Process one event.
    pub fn handle(&mut self, event: MeshEvent) -> Vec<MeshAction> {
        match event {
            MeshEvent::Start => self.handle_start(),
            MeshEvent::ConnectionOpened { peer_id, link } => self.handle_opened(&peer_id, link),
            MeshEvent::ConnectionFailed { peer_id, link, error } => {
                self.handle_dial_failed(&peer_id, link, error)
            },
            MeshEvent::IncomingConnection { peer_id, link } => self.handle_incoming(&peer_id, link),
            MeshEvent::ConnectionClosed { peer_id, link } => self.handle_closed(&peer_id, link),
            MeshEvent::ControlReceived { peer_id, link, message } => {
                self.handle_control(&peer_id, link, message)
            },
            MeshEvent::Tick => self.handle_tick(),
        }
    }

    fn handle_start(&mut self) -> Vec<MeshAction> {
        let Some(anchor) = self.anchor.clone() else {
            tracing::info!("{} starting as mesh anchor", self.local.peer_id);
            return Vec::new();
        };
        tracing::info!("{} joining mesh via {}", self.local.peer_id, anchor);
        self.discovered.insert(anchor.clone());
        self.dial(&anchor)
    }

    fn dial(&mut self, peer_id: &str) -> Vec<MeshAction> {
        if peer_id == self.local.peer_id || self.connections.contains_key(peer_id) {
            return Vec::new();
        }

        let attempts = self.backoff.get(peer_id).map_or(0, ReconnectBackoff::attempts);
        let open_timeout = if self.is_anchor(peer_id) {
            self.config.anchor_schedule.timeout_for(attempts)
        } else {
            self.config.connection.open_timeout
        };

        let link = self.allocate_link();
        let record = ConnectionRecord::outbound(
            peer_id.to_string(),
            link,
            self.env.now(),
            open_timeout,
            attempts,
            self.config.connection.clone(),
        );
        self.connections.insert(peer_id.to_string(), record);
        self.redials.remove(peer_id);

        tracing::debug!(
            "dialing {} on {} (attempt {}, timeout {:?})",
            peer_id,
            link,
            attempts,
            open_timeout
        );
        vec![
            MeshAction::Dial { peer_id: peer_id.to_string(), link, open_timeout },
            MeshAction::StatusChanged {
                peer_id: peer_id.to_string(),
                status: ConnectionStatus::Connecting,
            },
        ]
    }

    fn handle_opened(&mut self, peer_id: &str, link: LinkId) -> Vec<MeshAction> {
        let now = self.env.now();
        let current = self
            .connections
            .get_mut(peer_id)
            .filter(|c| c.link() == link && c.direction() == Direction::Outbound);
        let Some(record) = current else {
            tracing::debug!("{} opened after being superseded, closing", link);
            return vec![close(peer_id, link, "superseded")];
        };

        record.mark_open(now);
        self.link_established(peer_id)
    }

    fn handle_incoming(&mut self, peer_id: &str, link: LinkId) -> Vec<MeshAction> {
        let mut actions = Vec::new();

        if let Some(existing) = self.connections.get(peer_id) {
            let ours = existing.direction() == Direction::Outbound;
            if ours && should_initiate(&self.local.peer_id, peer_id) {
                tracing::debug!("keeping own link to {}, rejecting {}", peer_id, link);
                return vec![close(peer_id, link, "duplicate link")];
            }
            tracing::debug!("{} replaces {} for {}", link, existing.link(), peer_id);
            actions.push(close(peer_id, existing.link(), "replaced by incoming link"));
            // The remote side redialed, so it has dropped its end of the
            // ratchet; both ends re-establish on the new link's hello
            actions.push(MeshAction::DropSession { peer_id: peer_id.to_string() });
        }

        let record = ConnectionRecord::inbound(
            peer_id.to_string(),
            link,
            self.env.now(),
            self.config.connection.clone(),
        );
        self.connections.insert(peer_id.to_string(), record);
        self.redials.remove(peer_id);
        self.superseded.remove(peer_id);

        actions.extend(self.link_established(peer_id));
        actions
    }

    fn link_established(&mut self, peer_id: &str) -> Vec<MeshAction> {
        if let Some(backoff) = self.backoff.get_mut(peer_id) {
            backoff.reset();
        }
        if self.failed.remove(peer_id) {
            tracing::info!("{} reachable again after failure", peer_id);
        }
        tracing::info!("link to {} open", peer_id);

        vec![
            MeshAction::StatusChanged {
                peer_id: peer_id.to_string(),
                status: ConnectionStatus::Connected,
            },
            MeshAction::Send {
                peer_id: peer_id.to_string(),
                message: WireMessage::Hello(self.local.hello()),
            },
        ]
    }

    fn handle_dial_failed(
        &mut self,
        peer_id: &str,
        link: LinkId,
        error: ConnectionError,
    ) -> Vec<MeshAction> {
        let is_current = self.connections.get(peer_id).is_some_and(|c| c.link() == link);
        if !is_current {
            tracing::debug!("ignoring failure of stale {} to {}", link, peer_id);
            return Vec::new();
        }

        self.connections.remove(peer_id);
        tracing::warn!("dial to {} failed: {}", peer_id, error);
        self.schedule_retry(peer_id, error)
    }

    fn handle_closed(&mut self, peer_id: &str, link: LinkId) -> Vec<MeshAction> {
        let is_current = self.connections.get(peer_id).is_some_and(|c| c.link() == link);
        if !is_current {
            tracing::debug!("ignoring close of stale {} to {}", link, peer_id);
            return Vec::new();
        }

        self.connections.remove(peer_id);
        tracing::info!("link to {} closed", peer_id);

        let mut actions = vec![
            MeshAction::DropSession { peer_id: peer_id.to_string() },
            MeshAction::StatusChanged {
                peer_id: peer_id.to_string(),
                status: ConnectionStatus::Disconnected,
            },
        ];
        actions.extend(self.set_presence(peer_id, PresenceStatus::Offline));

        if self.is_anchor(peer_id) {
            actions.extend(self.schedule_retry(
                peer_id,
                ConnectionError::Transport("anchor link closed".to_string()),
            ));
        }
        actions
    }

    fn schedule_retry(&mut self, peer_id: &str, error: ConnectionError) -> Vec<MeshAction> {
        let max_attempts = self.config.max_reinit_attempts;
        let backoff = self
            .backoff
            .entry(peer_id.to_string())
            .or_insert_with(|| ReconnectBackoff::new(self.config.backoff.clone()));

        if backoff.attempts() >= max_attempts {
            let attempts = backoff.attempts();
            self.redials.remove(peer_id);
            if !self.failed.insert(peer_id.to_string()) {
                return Vec::new();
            }
            tracing::error!("giving up on {} after {} retries: {}", peer_id, attempts, error);
            return vec![
                MeshAction::StatusChanged {
                    peer_id: peer_id.to_string(),
                    status: ConnectionStatus::Failed { retry_attempts: attempts },
                },
                MeshAction::Failed {
                    peer_id: peer_id.to_string(),
                    error: ConnectionError::RetriesExhausted { attempts },
                },
            ];
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        self.redials
            .insert(peer_id.to_string(), PendingRedial { scheduled_at: self.env.now(), delay });

        tracing::debug!("retry {} to {} in {:?}", attempt, peer_id, delay);
        vec![MeshAction::RetryScheduled { peer_id: peer_id.to_string(), attempt, delay }]
    }

    fn handle_control(
        &mut self,
        peer_id: &str,
        link: LinkId,
        message: WireMessage,
    ) -> Vec<MeshAction> {
        let now = self.env.now();
        let wall = self.env.wall_clock_millis();

        let Some(record) = self.connections.get_mut(peer_id).filter(|c| c.link() == link) else {
            tracing::debug!("dropping {} from stale {}", message.type_name(), link);
            return Vec::new();
        };
        record.touch(now);

        match message {
            WireMessage::Hello(hello) => self.handle_hello(peer_id, &hello),
            WireMessage::PeerList(list) => self.handle_peer_list(peer_id, list),
            WireMessage::MemberUpdate(update) => {
                self.roster.apply_patch(peer_id, &update.updates, wall).map_or_else(Vec::new, |m| {
                    vec![MeshAction::MemberChanged(m.clone())]
                })
            },
            WireMessage::Ping(ping) => vec![MeshAction::Send {
                peer_id: peer_id.to_string(),
                message: WireMessage::Pong(ping),
            }],
            WireMessage::Pong(Heartbeat { timestamp }) => {
                if record.handle_pong(timestamp, now, wall) {
                    tracing::info!("{} responsive again", peer_id);
                    self.set_presence(peer_id, PresenceStatus::Online)
                } else {
                    Vec::new()
                }
            },
            other => {
                tracing::debug!("{} is not a control message, ignoring", other.type_name());
                Vec::new()
            },
        }
    }

    fn handle_hello(&mut self, peer_id: &str, hello: &Hello) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        let wall = self.env.wall_clock_millis();

        let previously_connected: Vec<String> = self
            .connected_peers()
            .into_iter()
            .filter(|p| p != peer_id && self.roster.contains(p))
            .collect();

        match self.roster.upsert_from_hello(peer_id, hello, wall) {
            Upsert::Replaced { previous_connection_id } => {
                tracing::info!(
                    "device {} moved from {} to {}",
                    hello.device_id,
                    previous_connection_id,
                    peer_id
                );
                actions.extend(self.retire(&previous_connection_id));
            },
            Upsert::Added => tracing::info!("{} ({}) joined", peer_id, hello.name),
            Upsert::Refreshed => {},
        }
        if let Some(member) = self.roster.get(peer_id) {
            actions.push(MeshAction::MemberChanged(member.clone()));
        }

        let others: Vec<String> =
            previously_connected.iter().filter(|p| self.roster.contains(p)).cloned().collect();
        actions.push(MeshAction::Send {
            peer_id: peer_id.to_string(),
            message: WireMessage::PeerList(PeerList { peers: others.clone() }),
        });
        for other in others {
            actions.push(MeshAction::Send {
                peer_id: other,
                message: WireMessage::PeerList(PeerList { peers: vec![peer_id.to_string()] }),
            });
        }

        self.discovered.insert(peer_id.to_string());
        actions.push(MeshAction::EstablishSession {
            peer_id: peer_id.to_string(),
            user_id: hello.user_id.clone(),
        });
        actions
    }

    /// Forget a connection id superseded by the same device's new one.
    fn retire(&mut self, old_peer_id: &str) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        if let Some(record) = self.connections.remove(old_peer_id) {
            actions.push(close(old_peer_id, record.link(), "device reconnected"));
        }
        self.discovered.remove(old_peer_id);
        self.redials.remove(old_peer_id);
        self.backoff.remove(old_peer_id);
        self.failed.remove(old_peer_id);
        self.superseded.insert(old_peer_id.to_string());
        actions.push(MeshAction::DropSession { peer_id: old_peer_id.to_string() });
        actions
    }

    fn handle_peer_list(&mut self, from: &str, list: PeerList) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        for peer_id in list.peers {
            if !self.wants_dial(&peer_id) {
                continue;
            }
            tracing::debug!("learned {} from {}", peer_id, from);
            self.discovered.insert(peer_id.clone());
            actions.extend(self.dial(&peer_id));
        }
        actions
    }

    fn wants_dial(&self, peer_id: &str) -> bool {
        peer_id != self.local.peer_id
            && !self.connections.contains_key(peer_id)
            && !self.redials.contains_key(peer_id)
            && !self.failed.contains(peer_id)
            && !self.superseded.contains(peer_id)
    }

    fn handle_tick(&mut self) -> Vec<MeshAction> {
        let now = self.env.now();
        let wall = self.env.wall_clock_millis();
        let mut actions = Vec::new();

        let mut timed_out = Vec::new();
        let mut unresponsive = Vec::new();
        for (peer_id, record) in &mut self.connections {
            for action in record.tick(now, wall) {
                match action {
                    ConnectionAction::SendPing { timestamp } => actions.push(MeshAction::Send {
                        peer_id: peer_id.clone(),
                        message: WireMessage::Ping(Heartbeat { timestamp }),
                    }),
                    ConnectionAction::OpenTimedOut { elapsed } => {
                        timed_out.push((peer_id.clone(), record.link(), elapsed));
                    },
                    ConnectionAction::Unresponsive { elapsed } => {
                        tracing::warn!("{} missed pong ({:?}), marking offline", peer_id, elapsed);
                        unresponsive.push(peer_id.clone());
                    },
                }
            }
        }

        for peer_id in unresponsive {
            actions.extend(self.set_presence(&peer_id, PresenceStatus::Offline));
        }
        for (peer_id, link, elapsed) in timed_out {
            self.connections.remove(&peer_id);
            tracing::warn!("{} to {} timed out after {:?}", link, peer_id, elapsed);
            actions.push(close(&peer_id, link, "open timeout"));
            actions.extend(self.schedule_retry(&peer_id, ConnectionError::OpenTimeout { elapsed }));
        }

        let due: Vec<String> = self
            .redials
            .iter()
            .filter(|(_, r)| now - r.scheduled_at >= r.delay)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer_id in due {
            self.redials.remove(&peer_id);
            if !self.failed.contains(&peer_id) {
                actions.extend(self.dial(&peer_id));
            }
        }

        actions.extend(self.reconcile());
        actions
    }

    /// Re-dial known peers that have no link, no pending retry and no
    /// terminal failure. The anchor is always dialed; other peers only by the
    /// tie-break winner, so a healed pair dials once.
    fn reconcile(&mut self) -> Vec<MeshAction> {
        let candidates: BTreeSet<String> = self
            .roster
            .iter()
            .map(|m| m.connection_id.clone())
            .chain(self.discovered.iter().cloned())
            .chain(self.anchor.iter().cloned())
            .filter(|p| self.wants_dial(p))
            .filter(|p| self.is_anchor(p) || should_initiate(&self.local.peer_id, p))
            .collect();

        let mut actions = Vec::new();
        for peer_id in candidates {
            tracing::debug!("reconciling link to {}", peer_id);
            actions.extend(self.dial(&peer_id));
        }
        actions
    }

    fn set_presence(&mut self, peer_id: &str, status: PresenceStatus) -> Vec<MeshAction> {
        let wall = self.env.wall_clock_millis();
        self.roster
            .set_status(peer_id, status, wall)
            .map_or_else(Vec::new, |m| vec![MeshAction::MemberChanged(m.clone())])
    }

    fn is_anchor(&self, peer_id: &str) -> bool {
        self.anchor.as_deref() == Some(peer_id)
    }
}

impl<E: Environment> std::fmt::Debug for MeshCoordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCoordinator")
            .field("local", &self.local.peer_id)
            .field("anchor", &self.anchor)
            .field("connections", &self.connections.len())
            .field("members", &self.roster.len())
            .field("failed", &self.failed.len())
            .finish_non_exhaustive()
    }
}

fn close(peer_id: &str, link: LinkId, reason: &str) -> MeshAction {
    MeshAction::CloseLink { peer_id: peer_id.to_string(), link, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{connection::DEFAULT_OPEN_TIMEOUT, env::test_utils::MockEnv, registry::Role};

    fn local(id: &str) -> LocalPeer {
        LocalPeer {
            peer_id: id.to_string(),
            name: format!("{id}-name"),
            device_id: format!("{id}-device"),
            user_id: format!("{id}-user"),
        }
    }

    fn hello(id: &str) -> WireMessage {
        WireMessage::Hello(local(id).hello())
    }

    fn coordinator(id: &str, anchor: Option<&str>) -> (MeshCoordinator<MockEnv>, MockEnv) {
        let env = MockEnv::with_seed(7);
        let mesh = MeshCoordinator::new(
            env.clone(),
            local(id),
            anchor.map(str::to_string),
            MeshConfig::default(),
        );
        (mesh, env)
    }

    fn dialed(actions: &[MeshAction]) -> Vec<(String, LinkId, Duration)> {
        actions
            .iter()
            .filter_map(|a| match a {
                MeshAction::Dial { peer_id, link, open_timeout } => {
                    Some((peer_id.clone(), *link, *open_timeout))
                },
                _ => None,
            })
            .collect()
    }

    /// Accepts an incoming link from `peer` and processes its hello.
    fn accept(mesh: &mut MeshCoordinator<MockEnv>, peer: &str) -> LinkId {
        let link = mesh.allocate_link();
        mesh.handle(MeshEvent::IncomingConnection { peer_id: peer.into(), link });
        let message = hello(peer);
        mesh.handle(MeshEvent::ControlReceived { peer_id: peer.into(), link, message });
        link
    }

    /// Opens an outbound link to the anchor and returns its link id.
    fn join(mesh: &mut MeshCoordinator<MockEnv>, anchor: &str) -> LinkId {
        let actions = mesh.handle(MeshEvent::Start);
        let (_, link, _) = dialed(&actions)[0].clone();
        mesh.handle(MeshEvent::ConnectionOpened { peer_id: anchor.to_string(), link });
        link
    }

    #[test]
    fn tie_break_examples() {
        assert!(should_initiate("peer-b", "peer-a"));
        assert!(!should_initiate("peer-a", "peer-b"));
        assert!(!should_initiate("same", "same"));
    }

    #[test]
    fn start_dials_anchor_with_schedule_timeout() {
        let (mut mesh, _) = coordinator("alice", Some("anchor"));
        let actions = mesh.handle(MeshEvent::Start);

        let dials = dialed(&actions);
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, "anchor");
        assert_eq!(dials[0].2, Duration::from_secs(30));
        assert!(actions.contains(&MeshAction::StatusChanged {
            peer_id: "anchor".to_string(),
            status: ConnectionStatus::Connecting,
        }));
    }

    #[test]
    fn anchor_does_not_dial_itself() {
        let (mut mesh, _) = coordinator("anchor", Some("anchor"));
        assert!(mesh.handle(MeshEvent::Start).is_empty());
    }

    #[test]
    fn open_sends_hello() {
        let (mut mesh, _) = coordinator("alice", Some("anchor"));
        let link = dialed(&mesh.handle(MeshEvent::Start))[0].1;

        let actions =
            mesh.handle(MeshEvent::ConnectionOpened { peer_id: "anchor".to_string(), link });
        assert!(actions.contains(&MeshAction::Send {
            peer_id: "anchor".to_string(),
            message: hello("alice"),
        }));
        assert!(mesh.connection("anchor").unwrap().is_open());
    }

    #[test]
    fn hello_registers_member_and_gossips() {
        let (mut mesh, _) = coordinator("anchor", None);

        let link_b = mesh.allocate_link();
        mesh.handle(MeshEvent::IncomingConnection { peer_id: "bob".into(), link: link_b });
        mesh.handle(MeshEvent::ControlReceived {
            peer_id: "bob".into(),
            link: link_b,
            message: hello("bob"),
        });

        let link_c = mesh.allocate_link();
        mesh.handle(MeshEvent::IncomingConnection { peer_id: "carol".into(), link: link_c });
        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "carol".into(),
            link: link_c,
            message: hello("carol"),
        });

        // Newcomer learns the existing peers
        assert!(actions.contains(&MeshAction::Send {
            peer_id: "carol".into(),
            message: WireMessage::PeerList(PeerList { peers: vec!["bob".into()] }),
        }));
        // Existing peers learn the newcomer
        assert!(actions.contains(&MeshAction::Send {
            peer_id: "bob".into(),
            message: WireMessage::PeerList(PeerList { peers: vec!["carol".into()] }),
        }));
        assert!(actions.contains(&MeshAction::EstablishSession {
            peer_id: "carol".into(),
            user_id: "carol-user".into(),
        }));
        assert_eq!(mesh.roster().len(), 2);
    }

    #[test]
    fn reconnecting_device_replaces_old_entry() {
        let (mut mesh, _) = coordinator("anchor", None);

        let old = mesh.allocate_link();
        mesh.handle(MeshEvent::IncomingConnection { peer_id: "bob-1".into(), link: old });
        mesh.handle(MeshEvent::ControlReceived {
            peer_id: "bob-1".into(),
            link: old,
            message: hello("bob"),
        });

        let new = mesh.allocate_link();
        mesh.handle(MeshEvent::IncomingConnection { peer_id: "bob-2".into(), link: new });
        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "bob-2".into(),
            link: new,
            message: hello("bob"),
        });

        assert!(actions.contains(&close("bob-1", old, "device reconnected")));
        assert!(actions.contains(&MeshAction::DropSession { peer_id: "bob-1".into() }));
        assert_eq!(mesh.roster().len(), 1);
        assert!(mesh.roster().get("bob-2").is_some());
        assert!(mesh.connection("bob-1").is_none());

        // Gossip about the old id is ignored
        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "bob-2".into(),
            link: new,
            message: WireMessage::PeerList(PeerList { peers: vec!["bob-1".into()] }),
        });
        assert!(dialed(&actions).is_empty());
    }

    #[test]
    fn peer_list_dials_unknown_peers_once() {
        let (mut mesh, _) = coordinator("alice", Some("anchor"));
        let link = join(&mut mesh, "anchor");

        let list = WireMessage::PeerList(PeerList {
            peers: vec!["alice".into(), "anchor".into(), "carol".into()],
        });
        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "anchor".into(),
            link,
            message: list.clone(),
        });
        let dials = dialed(&actions);
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, "carol");
        assert_eq!(dials[0].2, DEFAULT_OPEN_TIMEOUT);

        // Already dialing carol
        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "anchor".into(),
            link,
            message: list,
        });
        assert!(dialed(&actions).is_empty());
    }

    #[test]
    fn ping_answered_with_pong() {
        let (mut mesh, _) = coordinator("alice", Some("anchor"));
        let link = join(&mut mesh, "anchor");

        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "anchor".into(),
            link,
            message: WireMessage::Ping(Heartbeat { timestamp: 42 }),
        });
        assert_eq!(actions, vec![MeshAction::Send {
            peer_id: "anchor".into(),
            message: WireMessage::Pong(Heartbeat { timestamp: 42 }),
        }]);
    }

    #[test]
    fn stale_link_events_ignored() {
        let (mut mesh, _) = coordinator("alice", Some("anchor"));
        let link = join(&mut mesh, "anchor");
        let stale = LinkId(link.0 + 100);

        assert!(
            mesh.handle(MeshEvent::ConnectionClosed { peer_id: "anchor".into(), link: stale })
                .is_empty()
        );
        assert!(
            mesh.handle(MeshEvent::ControlReceived {
                peer_id: "anchor".into(),
                link: stale,
                message: hello("anchor"),
            })
            .is_empty()
        );
        assert!(mesh.connection("anchor").unwrap().is_open());
    }

    #[test]
    fn simultaneous_dial_keeps_greater_initiator_link() {
        // bob > alice: bob keeps its own outbound link
        let (mut bob, _) = coordinator("bob", None);
        let actions = bob.handle_peer_list("anchor", PeerList { peers: vec!["alice".into()] });
        let own = dialed(&actions)[0].1;

        let incoming = bob.allocate_link();
        let actions =
            bob.handle(MeshEvent::IncomingConnection { peer_id: "alice".into(), link: incoming });
        assert_eq!(actions, vec![close("alice", incoming, "duplicate link")]);
        assert_eq!(bob.connection("alice").unwrap().link(), own);

        // alice < bob: alice yields her outbound link to bob's incoming one
        let (mut alice, _) = coordinator("alice", None);
        let actions = alice.handle_peer_list("anchor", PeerList { peers: vec!["bob".into()] });
        let own = dialed(&actions)[0].1;
        let incoming = alice.allocate_link();
        let actions =
            alice.handle(MeshEvent::IncomingConnection { peer_id: "bob".into(), link: incoming });
        assert!(actions.contains(&close("bob", own, "replaced by incoming link")));
        assert_eq!(alice.connection("bob").unwrap().link(), incoming);

        // Alice's own dial completing later is closed as superseded
        let actions =
            alice.handle(MeshEvent::ConnectionOpened { peer_id: "bob".into(), link: own });
        assert_eq!(actions, vec![close("bob", own, "superseded")]);
    }

    #[test]
    fn redial_over_live_link_drops_session_then_reestablishes() {
        let (mut anchor, _) = coordinator("anchor", None);
        let old = accept(&mut anchor, "bob");

        // bob saw the old link close and redialed; ours is still open
        let new = anchor.allocate_link();
        let actions =
            anchor.handle(MeshEvent::IncomingConnection { peer_id: "bob".into(), link: new });
        assert_eq!(&actions[..2], &[
            close("bob", old, "replaced by incoming link"),
            MeshAction::DropSession { peer_id: "bob".into() },
        ]);
        assert_eq!(anchor.connection("bob").unwrap().link(), new);

        // The late close of the old link changes nothing
        let closed = MeshEvent::ConnectionClosed { peer_id: "bob".into(), link: old };
        assert!(anchor.handle(closed).is_empty());

        let actions = anchor.handle(MeshEvent::ControlReceived {
            peer_id: "bob".into(),
            link: new,
            message: hello("bob"),
        });
        assert!(actions.contains(&MeshAction::EstablishSession {
            peer_id: "bob".into(),
            user_id: "bob-user".into(),
        }));
    }

    #[test]
    fn dial_failures_back_off_then_fail_once() {
        let (mut mesh, env) = coordinator("alice", Some("anchor"));
        let mut actions = mesh.handle(MeshEvent::Start);
        let mut expected_delays = vec![1, 2, 4, 8, 16].into_iter();

        loop {
            let (_, link, _) = dialed(&actions)[0].clone();
            actions = mesh.handle(MeshEvent::ConnectionFailed {
                peer_id: "anchor".into(),
                link,
                error: ConnectionError::Transport("refused".into()),
            });

            if let Some(MeshAction::Failed { error, .. }) =
                actions.iter().find(|a| matches!(a, MeshAction::Failed { .. }))
            {
                assert_eq!(*error, ConnectionError::RetriesExhausted { attempts: 5 });
                assert!(actions.contains(&MeshAction::StatusChanged {
                    peer_id: "anchor".into(),
                    status: ConnectionStatus::Failed { retry_attempts: 5 },
                }));
                break;
            }

            let Some(MeshAction::RetryScheduled { delay, .. }) = actions.first() else {
                panic!("expected retry, got {actions:?}");
            };
            assert_eq!(delay.as_secs(), expected_delays.next().unwrap());

            // Not yet due
            assert!(dialed(&mesh.handle(MeshEvent::Tick)).is_empty());
            env.advance(*delay);
            actions = mesh.handle(MeshEvent::Tick);
        }

        assert!(mesh.is_failed("anchor"));
        // No further automatic attempts
        env.advance(Duration::from_secs(600));
        assert!(dialed(&mesh.handle(MeshEvent::Tick)).is_empty());
    }

    #[test]
    fn anchor_open_timeouts_escalate() {
        let (mut mesh, env) = coordinator("alice", Some("anchor"));
        let actions = mesh.handle(MeshEvent::Start);
        assert_eq!(dialed(&actions)[0].2, Duration::from_secs(30));

        env.advance(Duration::from_secs(31));
        let actions = mesh.handle(MeshEvent::Tick);
        assert!(actions.iter().any(|a| matches!(a, MeshAction::CloseLink { .. })));
        assert!(actions.iter().any(|a| matches!(a, MeshAction::RetryScheduled { attempt: 1, .. })));

        env.advance(Duration::from_secs(1));
        let actions = mesh.handle(MeshEvent::Tick);
        assert_eq!(dialed(&actions)[0].2, Duration::from_secs(60));
    }

    #[test]
    fn anchor_close_starts_backoff_and_open_resets_it() {
        let (mut mesh, env) = coordinator("alice", Some("anchor"));
        let link = join(&mut mesh, "anchor");

        let actions = mesh.handle(MeshEvent::ConnectionClosed { peer_id: "anchor".into(), link });
        assert!(actions.contains(&MeshAction::DropSession { peer_id: "anchor".into() }));
        assert!(actions.contains(&MeshAction::RetryScheduled {
            peer_id: "anchor".into(),
            attempt: 1,
            delay: Duration::from_secs(1),
        }));

        env.advance(Duration::from_secs(1));
        let link = dialed(&mesh.handle(MeshEvent::Tick))[0].1;
        mesh.handle(MeshEvent::ConnectionOpened { peer_id: "anchor".into(), link });

        let actions = mesh.handle(MeshEvent::ConnectionClosed { peer_id: "anchor".into(), link });
        assert!(actions.contains(&MeshAction::RetryScheduled {
            peer_id: "anchor".into(),
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
    }

    #[test]
    fn non_anchor_close_marks_offline_without_backoff() {
        let (mut mesh, _) = coordinator("anchor", None);
        let link = accept(&mut mesh, "bob");

        let actions = mesh.handle(MeshEvent::ConnectionClosed { peer_id: "bob".into(), link });
        assert!(!actions.iter().any(|a| matches!(a, MeshAction::RetryScheduled { .. })));
        assert_eq!(mesh.roster().get("bob").unwrap().status, PresenceStatus::Offline);
    }

    #[test]
    fn reconciliation_redials_only_as_tie_break_winner() {
        // "zed" > "bob": zed redials a closed link to bob on the next tick
        let (mut zed, _) = coordinator("zed", None);
        let link = accept(&mut zed, "bob");
        zed.handle(MeshEvent::ConnectionClosed { peer_id: "bob".into(), link });

        let dials = dialed(&zed.handle(MeshEvent::Tick));
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, "bob");

        // "bob" < "zed": bob waits
        let (mut bob, _) = coordinator("bob", None);
        let link = accept(&mut bob, "zed");
        bob.handle(MeshEvent::ConnectionClosed { peer_id: "zed".into(), link });
        assert!(dialed(&bob.handle(MeshEvent::Tick)).is_empty());
    }

    #[test]
    fn missed_pong_marks_offline_and_pong_restores() {
        let (mut mesh, env) = coordinator("alice", Some("anchor"));
        let link = join(&mut mesh, "anchor");
        mesh.handle(MeshEvent::ControlReceived {
            peer_id: "anchor".into(),
            link,
            message: hello("anchor"),
        });

        let actions = mesh.handle(MeshEvent::Tick);
        let Some(MeshAction::Send { message: WireMessage::Ping(ping), .. }) =
            actions.iter().find(|a| matches!(a, MeshAction::Send { .. }))
        else {
            panic!("expected ping, got {actions:?}");
        };
        let ping = *ping;

        env.advance(Duration::from_secs(6));
        let actions = mesh.handle(MeshEvent::Tick);
        assert!(actions.iter().any(|a| matches!(
            a,
            MeshAction::MemberChanged(m) if m.status == PresenceStatus::Offline
        )));
        // The link itself stays up
        assert!(mesh.connection("anchor").unwrap().is_open());

        let actions = mesh.handle(MeshEvent::ControlReceived {
            peer_id: "anchor".into(),
            link,
            message: WireMessage::Pong(ping),
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            MeshAction::MemberChanged(m) if m.status == PresenceStatus::Online
        )));
    }

    proptest! {
        /// PROPERTY: for distinct identifiers exactly one side initiates,
        /// whichever side evaluates the rule.
        #[test]
        fn prop_tie_break_is_antisymmetric(a in "[a-z0-9-]{1,12}", b in "[a-z0-9-]{1,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(should_initiate(&a, &b), should_initiate(&b, &a));
            prop_assert_eq!(Role::for_pair(&a, &b) == Role::Initiator, should_initiate(&a, &b));
        }
    }
}
