//! In-process transport.
//!
//! Every endpoint registers under its connection identifier in a shared
//! [`MemoryNetwork`]. A dial creates two one-directional pipes. Each pipe is
//! drained by a pump task into the remote's inbound queue, and the sender's
//! `buffered_amount` counts bytes the pump has not handed over yet. A slow
//! reader therefore shows up as backpressure exactly like a real data channel.
//!
//! [`MemoryNetwork::drop_silently`] breaks a link for one side only, the way
//! a path failure is often noticed by one peer long before the other.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::TransportError,
    transport::{Channel, Connector, Endpoint, IncomingLink, Link, LinkSignal},
};

/// Frames each receiver buffers before its pump blocks.
const INBOUND_CAPACITY: usize = 64;

/// Pending incoming links per endpoint.
const ACCEPT_BACKLOG: usize = 32;

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// One side's view of a link, kept for fault injection.
struct LinkTap {
    owner: String,
    remote: String,
    /// Feeds the owner's inbound queue
    inbound: mpsc::Sender<LinkSignal>,
    channel: Weak<dyn Channel>,
}

/// Shared registry of in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<IncomingLink>>>>,
    taps: Arc<Mutex<Vec<LinkTap>>>,
    /// Silently dropped halves, kept alive so the remote is not told
    severed: Arc<Mutex<Vec<Arc<dyn Channel>>>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id` and return its endpoint. Registering the same id
    /// again replaces the earlier endpoint.
    pub fn endpoint(&self, peer_id: &str) -> Endpoint {
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        self.lock().insert(peer_id.to_string(), tx);

        let connector =
            Arc::new(MemoryConnector { local_id: peer_id.to_string(), network: self.clone() });
        Endpoint { connector, incoming }
    }

    /// Unregister `peer_id`; later dials to it fail. Existing links are not
    /// touched.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.lock().remove(peer_id).is_some()
    }

    /// Report every link between `local` and `remote` as closed to `local`
    /// only. The remote keeps its half open until it notices on its own.
    /// Returns how many links were broken.
    pub fn drop_silently(&self, local: &str, remote: &str) -> usize {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        let mut severed = self.severed.lock().unwrap_or_else(PoisonError::into_inner);
        taps.retain(|tap| !tap.inbound.is_closed());
        severed.retain(|channel| channel.is_open());

        let mut dropped = 0;
        for tap in taps.iter().filter(|tap| tap.owner == local && tap.remote == remote) {
            let Some(channel) = tap.channel.upgrade() else { continue };
            if tap.inbound.try_send(LinkSignal::Closed).is_ok() {
                severed.push(channel);
                dropped += 1;
            }
        }
        dropped
    }

    fn acceptor(&self, peer_id: &str) -> Option<mpsc::Sender<IncomingLink>> {
        self.lock().get(peer_id).cloned()
    }

    fn register(&self, tap: LinkTap) {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        taps.retain(|tap| !tap.inbound.is_closed());
        taps.push(tap);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<IncomingLink>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").field("endpoints", &self.lock().len()).finish()
    }
}

struct MemoryConnector {
    local_id: String,
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, peer_id: &str) -> Result<Link, TransportError> {
        let acceptor = self
            .network
            .acceptor(peer_id)
            .ok_or_else(|| TransportError::Unreachable(peer_id.to_string()))?;

        let (local, remote, [local_inbound, remote_inbound]) = pipe_pair();
        self.network.register(LinkTap {
            owner: self.local_id.clone(),
            remote: peer_id.to_string(),
            inbound: local_inbound,
            channel: Arc::downgrade(&local.channel),
        });
        self.network.register(LinkTap {
            owner: peer_id.to_string(),
            remote: self.local_id.clone(),
            inbound: remote_inbound,
            channel: Arc::downgrade(&remote.channel),
        });
        acceptor
            .send(IncomingLink { peer_id: self.local_id.clone(), link: remote })
            .await
            .map_err(|_| TransportError::Unreachable(peer_id.to_string()))?;

        tracing::trace!("memory link {} -> {}", self.local_id, peer_id);
        Ok(local)
    }
}

/// Sending half of an in-process pipe.
struct MemoryChannel {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    /// Shared by both halves of the link
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

type Taps = [mpsc::Sender<LinkSignal>; 2];

/// Both halves of a link, plus senders into each half's inbound queue.
fn pipe_pair() -> (Link, Link, Taps) {
    let open = Arc::new(AtomicBool::new(true));
    let (a_channel, b_inbound, b_tap) = pipe(Arc::clone(&open));
    let (b_channel, a_inbound, a_tap) = pipe(open);
    let a = Link { channel: a_channel, inbound: a_inbound };
    let b = Link { channel: b_channel, inbound: b_inbound };
    (a, b, [a_tap, b_tap])
}

fn pipe(
    open: Arc<AtomicBool>,
) -> (Arc<dyn Channel>, mpsc::Receiver<LinkSignal>, mpsc::Sender<LinkSignal>) {
    let (outgoing, pending) = mpsc::unbounded_channel();
    let (deliver, inbound) = mpsc::channel(INBOUND_CAPACITY);
    let buffered = Arc::new(AtomicUsize::new(0));
    let tap = deliver.clone();

    tokio::spawn(pump(pending, deliver, Arc::clone(&buffered), Arc::clone(&open)));

    (Arc::new(MemoryChannel { outgoing, buffered, open }), inbound, tap)
}

/// Moves frames from one side's queue to the other side's inbound.
///
/// Ends when the sender closes or drops its channel, or the receiver goes
/// away; either way the link is marked closed for both sides.
async fn pump(
    mut pending: mpsc::UnboundedReceiver<Outgoing>,
    deliver: mpsc::Sender<LinkSignal>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
) {
    while let Some(Outgoing::Frame(frame)) = pending.recv().await {
        let len = frame.len();
        let delivered = deliver.send(LinkSignal::Frame(frame)).await.is_ok();
        buffered.fetch_sub(len, Ordering::SeqCst);
        if !delivered || !open.load(Ordering::SeqCst) {
            break;
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = deliver.send(LinkSignal::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_delivers_frames_both_ways() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");
        let mut bob = network.endpoint("bob");

        let mut to_bob = alice.connector.dial("bob").await.unwrap();
        let mut from_alice = bob.incoming.recv().await.unwrap();
        assert_eq!(from_alice.peer_id, "alice");

        to_bob.channel.send(b"one".to_vec()).await.unwrap();
        to_bob.channel.send(b"two".to_vec()).await.unwrap();
        assert_eq!(from_alice.link.inbound.recv().await, Some(LinkSignal::Frame(b"one".to_vec())));
        assert_eq!(from_alice.link.inbound.recv().await, Some(LinkSignal::Frame(b"two".to_vec())));

        from_alice.link.channel.send(b"back".to_vec()).await.unwrap();
        assert_eq!(to_bob.inbound.recv().await, Some(LinkSignal::Frame(b"back".to_vec())));
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");

        let err = alice.connector.dial("nobody").await.unwrap_err();
        assert_eq!(err, TransportError::Unreachable("nobody".to_string()));
    }

    #[tokio::test]
    async fn disconnected_endpoint_cannot_be_dialed() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");
        let _bob = network.endpoint("bob");

        assert!(network.disconnect("bob"));
        assert!(alice.connector.dial("bob").await.is_err());
    }

    #[tokio::test]
    async fn close_is_observed_by_remote() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");
        let mut bob = network.endpoint("bob");

        let link = alice.connector.dial("bob").await.unwrap();
        let mut incoming = bob.incoming.recv().await.unwrap();

        link.channel.close();
        assert!(!link.channel.is_open());
        assert_eq!(incoming.link.inbound.recv().await, Some(LinkSignal::Closed));
        assert!(!incoming.link.channel.is_open());
        assert_eq!(
            incoming.link.channel.send(vec![1]).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn silent_drop_is_seen_by_one_side_only() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");
        let mut bob = network.endpoint("bob");

        let mut link = alice.connector.dial("bob").await.unwrap();
        let mut incoming = bob.incoming.recv().await.unwrap();

        assert_eq!(network.drop_silently("bob", "alice"), 1);
        assert_eq!(incoming.link.inbound.recv().await, Some(LinkSignal::Closed));

        // bob lets go of its half; alice can still send and hears nothing
        drop(incoming);
        tokio::task::yield_now().await;
        assert!(link.channel.is_open());
        assert!(link.inbound.try_recv().is_err());
        assert_eq!(network.drop_silently("carol", "alice"), 0);
    }

    #[tokio::test]
    async fn unread_frames_count_as_buffered() {
        let network = MemoryNetwork::new();
        let alice = network.endpoint("alice");
        let mut bob = network.endpoint("bob");

        let link = alice.connector.dial("bob").await.unwrap();
        let mut incoming = bob.incoming.recv().await.unwrap();

        // Fill the receiver's queue without reading it
        for _ in 0..INBOUND_CAPACITY + 8 {
            link.channel.send(vec![0; 100]).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(link.channel.buffered_amount() >= 8 * 100);

        while link.channel.buffered_amount() > 0 {
            incoming.link.inbound.recv().await.unwrap();
            tokio::task::yield_now().await;
        }
    }
}
