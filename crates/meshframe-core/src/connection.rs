//! Per-link state machine.
//!
//! Tracks one transport link to one peer: whether it opened in time, when it
//! last showed activity, and whether pings are being answered. Uses the
//! action pattern: methods take time as input and return actions for the
//! coordinator to act on. No I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐  opened   ┌──────┐
//! │ Connecting │──────────>│ Open │
//! └────────────┘           └──────┘
//!       │ open timeout         │ closed / replaced
//!       ↓                      ↓
//!  ┌────────┐             ┌────────┐
//!  │ Closed │             │ Closed │
//!  └────────┘             └────────┘
//! ```
//!
//! Inbound links start in `Open`: the transport only reports them once they
//! are usable.

use std::{ops::Sub, time::Duration};

use crate::metrics::LinkMetrics;

/// Time allowed for an outbound link to open (non-anchor peers).
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between pings on an open link.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Time after which an unanswered ping marks the peer offline.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of one transport link; a peer may be reached over several
/// links over time, but has at most one current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Which side dialed the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed
    Outbound,
    /// The peer dialed
    Inbound,
}

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Dial in progress
    Connecting,
    /// Usable
    Open,
    /// Closed or abandoned
    Closed,
}

/// Link timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Open timeout for outbound links to non-anchor peers
    pub open_timeout: Duration,
    /// Interval between pings
    pub ping_interval: Duration,
    /// Pong deadline before marking the peer offline
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// Actions returned by [`ConnectionRecord::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send a ping carrying this wall-clock timestamp
    SendPing {
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },

    /// The link did not open in time and is now closed
    OpenTimedOut {
        /// Time since the dial started
        elapsed: Duration,
    },

    /// The last ping went unanswered; the peer should be shown offline
    Unresponsive {
        /// Time since the unanswered ping
        elapsed: Duration,
    },
}

/// One link to one peer, plus liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionRecord<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    peer_id: String,
    link: LinkId,
    direction: Direction,
    state: LinkState,
    config: ConnectionConfig,
    /// Effective open timeout (anchor links use the graduated schedule)
    open_timeout: Duration,
    created_at: I,
    last_activity: I,
    last_ping: Option<I>,
    /// Timestamp and send time of the ping awaiting a pong
    outstanding_ping: Option<(u64, I)>,
    responsive: bool,
    reconnect_attempts: u32,
    metrics: LinkMetrics,
}

impl<I> ConnectionRecord<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Record for a link we are dialing.
    pub fn outbound(
        peer_id: String,
        link: LinkId,
        now: I,
        open_timeout: Duration,
        reconnect_attempts: u32,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            peer_id,
            link,
            direction: Direction::Outbound,
            state: LinkState::Connecting,
            config,
            open_timeout,
            created_at: now,
            last_activity: now,
            last_ping: None,
            outstanding_ping: None,
            responsive: true,
            reconnect_attempts,
            metrics: LinkMetrics::default(),
        }
    }

    /// Record for a link the peer dialed. Starts open.
    pub fn inbound(peer_id: String, link: LinkId, now: I, config: ConnectionConfig) -> Self {
        let open_timeout = config.open_timeout;
        let mut record = Self::outbound(peer_id, link, now, open_timeout, 0, config);
        record.direction = Direction::Inbound;
        record.state = LinkState::Open;
        record
    }

    /// Remote peer identifier.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Link identifier.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Which side dialed.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True in [`LinkState::Open`].
    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// False after an unanswered ping, until the next pong.
    pub fn is_responsive(&self) -> bool {
        self.responsive
    }

    /// Reconnect attempts that preceded this dial.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Open timeout in effect for this link.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// RTT and loss metrics.
    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    /// Transition `Connecting -> Open`.
    pub fn mark_open(&mut self, now: I) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Open;
            self.last_activity = now;
        }
    }

    /// Mark the link closed. Cancels open and pong deadlines.
    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.outstanding_ping = None;
    }

    /// Note inbound traffic.
    pub fn touch(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self, now: I) -> Duration {
        now - self.last_activity
    }

    /// Process a pong. Returns true if the peer was unresponsive and is now
    /// back.
    pub fn handle_pong(&mut self, timestamp: u64, now: I, wall_clock_ms: u64) -> bool {
        self.touch(now);

        if let Some((expected, _)) = self.outstanding_ping {
            if expected == timestamp {
                self.metrics.record_rtt(wall_clock_ms.saturating_sub(timestamp));
                self.outstanding_ping = None;
            }
        }

        let recovered = !self.responsive;
        self.responsive = true;
        recovered
    }

    /// Periodic maintenance: open timeout, pong deadline, ping schedule.
    pub fn tick(&mut self, now: I, wall_clock_ms: u64) -> Vec<ConnectionAction> {
        match self.state {
            LinkState::Closed => Vec::new(),
            LinkState::Connecting => {
                let elapsed = now - self.created_at;
                if elapsed > self.open_timeout {
                    self.close();
                    vec![ConnectionAction::OpenTimedOut { elapsed }]
                } else {
                    Vec::new()
                }
            },
            LinkState::Open => self.tick_open(now, wall_clock_ms),
        }
    }

    fn tick_open(&mut self, now: I, wall_clock_ms: u64) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if let Some((_, sent_at)) = self.outstanding_ping {
            let elapsed = now - sent_at;
            if elapsed <= self.config.pong_timeout {
                return actions;
            }
            self.outstanding_ping = None;
            self.metrics.record_loss();
            if self.responsive {
                self.responsive = false;
                actions.push(ConnectionAction::Unresponsive { elapsed });
            }
        }

        let ping_due = match self.last_ping {
            None => true,
            Some(last) => now - last >= self.config.ping_interval,
        };
        if ping_due {
            self.last_ping = Some(now);
            self.outstanding_ping = Some((wall_clock_ms, now));
            self.metrics.record_ping();
            actions.push(ConnectionAction::SendPing { timestamp: wall_clock_ms });
        }

        actions
    }
}
