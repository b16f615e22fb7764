//! Transport boundary.
//!
//! The mesh assumes an external point-to-point transport that delivers
//! ordered, reliable frames between two reachable endpoints. These traits are
//! the whole contract: a [`Connector`] dials, an [`Endpoint`]'s incoming queue
//! accepts, and each [`Link`] pairs a sending [`Channel`] with a stream of
//! [`LinkSignal`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Sending half of a link.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue one frame for delivery.
    ///
    /// # Errors
    ///
    /// - `Closed` once either side closed the channel
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the remote side.
    fn buffered_amount(&self) -> usize;

    /// False once either side closed the channel.
    fn is_open(&self) -> bool;

    /// Close the channel; the remote side observes [`LinkSignal::Closed`].
    fn close(&self);
}

/// What the receiving half of a link yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// One frame, in send order
    Frame(Vec<u8>),
    /// The link closed normally
    Closed,
    /// The link failed
    Error(String),
}

/// An open link to one peer.
pub struct Link {
    /// Sending half
    pub channel: Arc<dyn Channel>,
    /// Receiving half
    pub inbound: mpsc::Receiver<LinkSignal>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("open", &self.channel.is_open()).finish_non_exhaustive()
    }
}

/// A link opened by a remote peer.
#[derive(Debug)]
pub struct IncomingLink {
    /// Connection identifier of the dialer
    pub peer_id: String,
    /// The link
    pub link: Link,
}

/// Opens links to peers by connection identifier.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `peer_id`.
    ///
    /// # Errors
    ///
    /// - `Unreachable` if nobody listens under that identifier
    async fn dial(&self, peer_id: &str) -> Result<Link, TransportError>;
}

/// A node's attachment point to the transport.
pub struct Endpoint {
    /// Outbound dialing
    pub connector: Arc<dyn Connector>,
    /// Links opened towards us
    pub incoming: mpsc::Receiver<IncomingLink>,
}
