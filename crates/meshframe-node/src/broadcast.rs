//! Outbound sends with backpressure.
//!
//! Before each frame the sender waits until the channel's unsent bytes fall
//! to the configured limit, polling at a fixed interval and yielding between
//! checks. A broadcast fans out to every peer concurrently and each peer's
//! outcome is independent: a slow or failed peer never blocks or aborts the
//! others.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;

use crate::{config::BroadcastConfig, error::TransportError, transport::Channel};

/// Result of sending to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame handed to the transport
    Sent,
    /// Held until the peer's session is ready
    Deferred,
    /// Not sent
    Dropped(String),
}

/// What to do for one peer, decided before any await.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Send this frame
    Frame(Vec<u8>),
    /// Message was queued for later
    Deferred,
    /// Message cannot go to this peer
    Dropped(String),
}

/// One peer's share of a broadcast.
pub struct Target {
    /// Remote peer
    pub peer_id: String,
    /// Its current channel
    pub channel: Arc<dyn Channel>,
    /// What to send
    pub prepared: Prepared,
}

/// Wait until `channel` has at most `limit` unsent bytes.
///
/// # Errors
///
/// - `Closed` if the channel closes while waiting
pub async fn wait_for_drain(
    channel: &dyn Channel,
    limit: usize,
    poll_interval: Duration,
) -> Result<(), TransportError> {
    while channel.buffered_amount() > limit {
        if !channel.is_open() {
            return Err(TransportError::Closed);
        }
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}

/// Backpressure-aware sender.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    config: BroadcastConfig,
}

impl Broadcaster {
    /// Sender with the given limits.
    pub fn new(config: BroadcastConfig) -> Self {
        Self { config }
    }

    /// Send one frame, waiting for the channel to drain first.
    ///
    /// # Errors
    ///
    /// - `Closed` if the channel is or becomes closed
    pub async fn send(&self, channel: &dyn Channel, frame: Vec<u8>) -> Result<(), TransportError> {
        wait_for_drain(channel, self.config.backpressure_limit, self.config.poll_interval).await?;
        channel.send(frame).await
    }

    /// Send a sequence of frames in order, draining before each.
    ///
    /// # Errors
    ///
    /// Stops at the first failure.
    pub async fn send_all(
        &self,
        channel: &dyn Channel,
        frames: &[Vec<u8>],
    ) -> Result<(), TransportError> {
        for frame in frames {
            self.send(channel, frame.clone()).await?;
        }
        Ok(())
    }

    /// Fan out to every target concurrently. Returns one outcome per target,
    /// in target order.
    pub async fn broadcast(&self, targets: Vec<Target>) -> Vec<(String, SendOutcome)> {
        let sends = targets.into_iter().map(|target| async move {
            let outcome = match target.prepared {
                Prepared::Frame(frame) => match self.send(target.channel.as_ref(), frame).await {
                    Ok(()) => SendOutcome::Sent,
                    Err(e) => {
                        tracing::debug!("send to {} failed: {}", target.peer_id, e);
                        SendOutcome::Dropped(e.to_string())
                    },
                },
                Prepared::Deferred => SendOutcome::Deferred,
                Prepared::Dropped(reason) => SendOutcome::Dropped(reason),
            };
            (target.peer_id, outcome)
        });
        join_all(sends).await
    }
}
