//! Per-peer inbound dispatch queue.
//!
//! Each peer gets its own FIFO worker. Items for one peer are handled one at
//! a time in arrival order, because handling mutates that peer's ratchet
//! session. Workers for different peers run concurrently. A peer's entry is
//! forgotten once its queue is closed and its worker has drained.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

type Handler<T> = Arc<dyn Fn(String, T) -> BoxFuture<'static, ()> + Send + Sync>;
type Queues<T> = Arc<Mutex<HashMap<String, PeerQueue<T>>>>;

struct PeerQueue<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    /// Held by a worker for its whole life, so a worker started after
    /// `close_peer` waits for the previous one to drain.
    gate: Arc<tokio::sync::Mutex<()>>,
}

/// Serializes inbound work per peer.
pub struct InboundDispatcher<T> {
    handler: Handler<T>,
    queues: Queues<T>,
}

impl<T: Send + 'static> InboundDispatcher<T> {
    /// Dispatcher calling `handler(peer_id, item)` for every item.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |peer, item| Box::pin(handler(peer, item)));
        Self { handler, queues: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Append `item` to `peer_id`'s queue, starting a worker if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, peer_id: &str, item: T) {
        let mut queues = self.lock();
        let queue = queues.entry(peer_id.to_string()).or_insert_with(|| PeerQueue {
            tx: None,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        });

        let item = match &queue.tx {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(item);
        let worker = Worker {
            peer_id: peer_id.to_string(),
            handler: Arc::clone(&self.handler),
            gate: Arc::clone(&queue.gate),
            queues: Arc::downgrade(&self.queues),
        };
        tokio::spawn(worker.run(rx));
        queue.tx = Some(tx);
    }

    /// Stop accepting items for `peer_id`. Items already queued are still
    /// handled; a later `enqueue` starts a new worker that runs after them.
    /// Returns false if the peer had no live queue.
    pub fn close_peer(&self, peer_id: &str) -> bool {
        self.lock().get_mut(peer_id).and_then(|q| q.tx.take()).is_some()
    }

    /// Peers with a live queue.
    pub fn active_peers(&self) -> usize {
        self.lock().values().filter(|q| q.tx.is_some()).count()
    }

    /// Peers with a live queue or a closed one still draining.
    pub fn tracked_peers(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerQueue<T>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker<T> {
    peer_id: String,
    handler: Handler<T>,
    gate: Arc<tokio::sync::Mutex<()>>,
    queues: Weak<Mutex<HashMap<String, PeerQueue<T>>>>,
}

impl<T> Worker<T> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<T>) {
        let _turn = Arc::clone(&self.gate).lock_owned().await;
        while let Some(item) = rx.recv().await {
            (self.handler)(self.peer_id.clone(), item).await;
        }
        tracing::trace!("dispatch worker for {} stopped", self.peer_id);
        self.forget();
    }

    /// Remove the peer's entry unless a newer worker has taken it over.
    fn forget(&self) {
        let Some(queues) = self.queues.upgrade() else { return };
        let mut queues = queues.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = queues
            .get(&self.peer_id)
            .is_some_and(|q| q.tx.is_none() && Arc::ptr_eq(&q.gate, &self.gate));
        if idle {
            queues.remove(&self.peer_id);
        }
    }
}

impl<T> std::fmt::Debug for InboundDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.queues.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("InboundDispatcher").field("peers", &peers).finish_non_exhaustive()
    }
}
