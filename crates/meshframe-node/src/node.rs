//! Node runtime.
//!
//! Executes the coordinator's actions against a real transport. One driver
//! task owns the tick timer, accepted links and dial outcomes; one reader
//! task per link feeds frames into the per-peer [`InboundDispatcher`]; the
//! dispatcher's workers decrypt, route and hand control messages back to the
//! coordinator.
//!
//! ```text
//! reader ──frames──> InboundDispatcher ──> route_inbound ──┬─> MeshCoordinator
//!                    (FIFO per peer)                       ├─> ChunkReassembler
//!                                                          └─> notifications
//! driver ──Tick / accepted / dialed───────────────────────────> MeshCoordinator
//! ```
//!
//! State lives behind `std::sync::Mutex`es that are only held for
//! synchronous sections, never across an await.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::future::join_all;
use meshframe_core::{
    ChunkReassembler, ConnectionError, ConnectionStatus, EnvRng, Environment, LinkId, Member,
    MeshAction, MeshCoordinator, MeshEvent, Reassembled, ReassemblyError, Role, RouteError,
    Routed, SessionError, SessionLookup, SessionRegistry, route_inbound,
};
use meshframe_crypto::{
    AttachmentKey, IdentityKeyPair, PUBLIC_KEY_SIZE, encrypt_attachment, split_chunks,
};
use meshframe_proto::{AttachmentRef, ChatMessage, FileChunk, MessageClass, WireMessage};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    broadcast::{Broadcaster, Prepared, SendOutcome, Target},
    config::NodeConfig,
    directory::KeyDirectory,
    dispatch::InboundDispatcher,
    error::NodeError,
    system_env::SystemEnv,
    transport::{Channel, Connector, Endpoint, IncomingLink, Link, LinkSignal},
};

/// Something the application should know about.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A peer's connection status changed
    Status {
        /// Remote peer
        peer_id: String,
        /// New status
        status: ConnectionStatus,
    },
    /// A roster entry was added or changed
    Member(Member),
    /// The peer's session can carry user messages
    SessionReady {
        /// Remote peer
        peer_id: String,
    },
    /// Chat message received
    Message {
        /// Sending peer
        from: String,
        /// The message
        message: ChatMessage,
    },
    /// Chat message edited
    Edited {
        /// Sending peer
        from: String,
        /// The new version
        message: ChatMessage,
    },
    /// Chat message deleted
    Deleted {
        /// Sending peer
        from: String,
        /// Deleted message id
        id: String,
    },
    /// Read receipt
    Read {
        /// Sending peer
        from: String,
        /// Message id read
        id: String,
    },
    /// Attachment reassembled and decrypted
    Attachment {
        /// Sending peer
        from: String,
        /// The file
        attachment: Reassembled,
    },
    /// Retries exhausted for a peer; reported once
    Failed {
        /// Remote peer
        peer_id: String,
        /// Final error
        error: ConnectionError,
    },
}

struct InboundFrame {
    link: LinkId,
    bytes: Vec<u8>,
}

enum Input {
    Mesh(MeshEvent),
    Dialed { peer_id: String, link: LinkId, transport: Link },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared<E: Environment> {
    env: E,
    config: NodeConfig,
    coordinator: Mutex<MeshCoordinator<E>>,
    registry: Mutex<SessionRegistry>,
    reassembler: Mutex<ChunkReassembler>,
    /// Transport channel per link, current or not yet accepted
    channels: Mutex<HashMap<LinkId, Arc<dyn Channel>>>,
    /// User messages waiting for a peer's session
    backlog: Mutex<HashMap<String, VecDeque<WireMessage>>>,
    dispatcher: InboundDispatcher<InboundFrame>,
    broadcaster: Broadcaster,
    connector: Arc<dyn Connector>,
    directory: Arc<dyn KeyDirectory>,
    inputs: mpsc::UnboundedSender<Input>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<E: Environment> Shared<E> {
    async fn process(&self, event: MeshEvent) {
        let actions = lock(&self.coordinator).handle(event);
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&self, action: MeshAction) {
        match action {
            MeshAction::Dial { peer_id, link, open_timeout } => {
                self.spawn_dial(peer_id, link, open_timeout);
            },
            MeshAction::Send { peer_id, message } => self.send_control(&peer_id, &message).await,
            MeshAction::CloseLink { peer_id, link, reason } => {
                tracing::debug!("closing {} to {}: {}", link, peer_id, reason);
                let channel = lock(&self.channels).remove(&link);
                if let Some(channel) = channel {
                    channel.close();
                }
            },
            MeshAction::EstablishSession { peer_id, user_id } => {
                self.establish(&peer_id, &user_id).await;
            },
            MeshAction::DropSession { peer_id } => self.drop_session(&peer_id),
            MeshAction::StatusChanged { peer_id, status } => {
                self.notify(Notification::Status { peer_id, status });
            },
            MeshAction::MemberChanged(member) => self.notify(Notification::Member(member)),
            MeshAction::RetryScheduled { peer_id, attempt, delay } => {
                tracing::debug!("retry {} for {} in {:?}", attempt, peer_id, delay);
            },
            MeshAction::Failed { peer_id, error } => {
                tracing::error!("giving up on {}: {}", peer_id, error);
                self.notify(Notification::Failed { peer_id, error });
            },
        }
    }

    fn spawn_dial(&self, peer_id: String, link: LinkId, open_timeout: Duration) {
        let connector = Arc::clone(&self.connector);
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let result = tokio::time::timeout(open_timeout, connector.dial(&peer_id)).await;
            let input = match result {
                Ok(Ok(transport)) => Input::Dialed { peer_id, link, transport },
                Ok(Err(e)) => Input::Mesh(MeshEvent::ConnectionFailed {
                    peer_id,
                    link,
                    error: ConnectionError::Transport(e.to_string()),
                }),
                // The coordinator enforces the open timeout on its own tick
                Err(_) => return,
            };
            let _ = inputs.send(input);
        });
    }

    fn spawn_reader(self: &Arc<Self>, peer_id: String, link: LinkId, transport: Link) {
        let shared = Arc::clone(self);
        let mut inbound = transport.inbound;

        tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                match signal {
                    LinkSignal::Frame(bytes) => {
                        shared.dispatcher.enqueue(&peer_id, InboundFrame { link, bytes });
                    },
                    LinkSignal::Closed => break,
                    LinkSignal::Error(e) => {
                        tracing::warn!("{} to {} failed: {}", link, peer_id, e);
                        break;
                    },
                }
            }

            lock(&shared.channels).remove(&link);
            let _ = shared.inputs.send(Input::Mesh(MeshEvent::ConnectionClosed { peer_id, link }));
        });
    }

    async fn handle_input(self: &Arc<Self>, input: Input) {
        match input {
            Input::Mesh(event) => self.process(event).await,
            Input::Dialed { peer_id, link, transport } => {
                lock(&self.channels).insert(link, Arc::clone(&transport.channel));
                self.process(MeshEvent::ConnectionOpened { peer_id: peer_id.clone(), link })
                    .await;
                self.start_reading(peer_id, link, transport);
            },
        }
    }

    async fn accept(self: &Arc<Self>, incoming: IncomingLink) {
        let IncomingLink { peer_id, link: transport } = incoming;
        let link = lock(&self.coordinator).allocate_link();
        lock(&self.channels).insert(link, Arc::clone(&transport.channel));

        self.process(MeshEvent::IncomingConnection { peer_id: peer_id.clone(), link }).await;
        self.start_reading(peer_id, link, transport);
    }

    /// Readers start after the coordinator has seen the link, so the first
    /// `hello` is never taken for a stale link.
    fn start_reading(self: &Arc<Self>, peer_id: String, link: LinkId, transport: Link) {
        let accepted = lock(&self.channels).contains_key(&link);
        if accepted {
            self.spawn_reader(peer_id, link, transport);
        }
    }

    fn channel_for(&self, peer_id: &str) -> Option<Arc<dyn Channel>> {
        let link = lock(&self.coordinator)
            .connection(peer_id)
            .filter(|c| c.is_open())
            .map(|c| c.link())?;
        lock(&self.channels).get(&link).cloned()
    }

    fn open_peers(&self) -> Vec<(String, Arc<dyn Channel>)> {
        let peers = lock(&self.coordinator).connected_peers();
        peers
            .into_iter()
            .filter_map(|peer| self.channel_for(&peer).map(|channel| (peer, channel)))
            .collect()
    }

    async fn send_control(&self, peer_id: &str, message: &WireMessage) {
        let Some(channel) = self.channel_for(peer_id) else {
            tracing::debug!("no open link to {} for {}", peer_id, message.type_name());
            return;
        };
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("cannot encode {}: {}", message.type_name(), e);
                return;
            },
        };
        if let Err(e) = self.broadcaster.send(channel.as_ref(), frame).await {
            tracing::debug!("send of {} to {} failed: {}", message.type_name(), peer_id, e);
        }
    }

    /// Decide what `peer_id` gets for `message`. User messages are sealed
    /// with the peer's session, or queued while it is not ready.
    fn prepare(&self, peer_id: &str, message: &WireMessage) -> Prepared {
        match message.class() {
            MessageClass::Control | MessageClass::Chunk => match message.encode() {
                Ok(frame) => Prepared::Frame(frame),
                Err(e) => Prepared::Dropped(e.to_string()),
            },
            MessageClass::Envelope => {
                Prepared::Dropped("envelopes are sealed per peer by the node".to_string())
            },
            MessageClass::User => {
                let lookup = lock(&self.registry).resolve(peer_id);
                match lookup {
                    SessionLookup::Ready => self.seal(peer_id, message),
                    SessionLookup::AwaitingInit | SessionLookup::NeedsHandshake => {
                        self.defer(peer_id, message)
                    },
                    SessionLookup::Fatal(e) => Prepared::Dropped(e.to_string()),
                }
            },
        }
    }

    fn seal(&self, peer_id: &str, message: &WireMessage) -> Prepared {
        let Some(logical_type) = message.logical_type() else {
            return Prepared::Dropped(format!("{} is not a user message", message.type_name()));
        };
        let plaintext = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => return Prepared::Dropped(e.to_string()),
        };

        let sealed = lock(&self.registry).encrypt_for(
            peer_id,
            logical_type,
            &plaintext,
            &mut EnvRng(&self.env),
        );
        let frame = match sealed {
            Ok(envelope) => WireMessage::EncryptedRatchet(envelope).encode(),
            Err(e) => {
                tracing::warn!("cannot seal {} for {}: {}", logical_type, peer_id, e);
                return Prepared::Dropped(e.to_string());
            },
        };
        match frame {
            Ok(frame) => Prepared::Frame(frame),
            Err(e) => Prepared::Dropped(e.to_string()),
        }
    }

    fn defer(&self, peer_id: &str, message: &WireMessage) -> Prepared {
        let mut backlog = lock(&self.backlog);
        let queue = backlog.entry(peer_id.to_string()).or_default();
        if queue.len() >= self.config.max_backlog {
            tracing::warn!("backlog for {} full, dropping {}", peer_id, message.type_name());
            return Prepared::Dropped("session backlog full".to_string());
        }
        queue.push_back(message.clone());
        Prepared::Deferred
    }

    async fn deliver(&self, peer_id: &str, prepared: Prepared) -> SendOutcome {
        let Some(channel) = self.channel_for(peer_id) else {
            return SendOutcome::Dropped(format!("no open link to {peer_id}"));
        };
        let target = Target { peer_id: peer_id.to_string(), channel, prepared };
        self.broadcaster
            .broadcast(vec![target])
            .await
            .pop()
            .map_or_else(|| SendOutcome::Dropped("no outcome".to_string()), |(_, o)| o)
    }

    async fn fan_out(
        &self,
        peers: &[(String, Arc<dyn Channel>)],
        message: &WireMessage,
    ) -> Vec<(String, SendOutcome)> {
        let targets = peers
            .iter()
            .map(|(peer_id, channel)| Target {
                peer_id: peer_id.clone(),
                channel: Arc::clone(channel),
                prepared: self.prepare(peer_id, message),
            })
            .collect();
        self.broadcaster.broadcast(targets).await
    }

    async fn establish(&self, peer_id: &str, user_id: &str) {
        let current = {
            let registry = lock(&self.registry);
            registry.user_of(peer_id) == Some(user_id)
                && !matches!(registry.resolve(peer_id), SessionLookup::Fatal(_))
        };
        if current {
            tracing::trace!("session with {} already established", peer_id);
            return;
        }

        let Some(remote_public) = self.directory.lookup(user_id).await else {
            let error = SessionError::KeyMaterialUnavailable { user_id: user_id.to_string() };
            let dropped = lock(&self.backlog).remove(peer_id).map_or(0, |q| q.len());
            tracing::warn!("no session with {}: {} ({} deferred dropped)", peer_id, error, dropped);
            return;
        };

        let role = lock(&self.registry).establish(
            peer_id,
            user_id,
            &remote_public,
            &mut EnvRng(&self.env),
        );
        tracing::info!("session with {} established as {:?}", peer_id, role);

        if role == Role::Initiator {
            let prepared = self.seal(peer_id, &WireMessage::RatchetInit);
            if let SendOutcome::Dropped(reason) = self.deliver(peer_id, prepared).await {
                tracing::warn!("ratchet-init to {} not sent: {}", peer_id, reason);
            }
            self.session_ready(peer_id).await;
        }
    }

    async fn session_ready(&self, peer_id: &str) {
        self.flush_backlog(peer_id).await;
        self.notify(Notification::SessionReady { peer_id: peer_id.to_string() });
    }

    async fn flush_backlog(&self, peer_id: &str) {
        let pending = lock(&self.backlog).remove(peer_id).unwrap_or_default();
        if !pending.is_empty() {
            tracing::debug!("flushing {} deferred messages to {}", pending.len(), peer_id);
        }
        for message in pending {
            let prepared = self.seal(peer_id, &message);
            if let SendOutcome::Dropped(reason) = self.deliver(peer_id, prepared).await {
                tracing::debug!("deferred {} to {} lost: {}", message.type_name(), peer_id, reason);
            }
        }
    }

    fn drop_session(&self, peer_id: &str) {
        let had_session = lock(&self.registry).remove(peer_id);
        let transfers = lock(&self.reassembler).drop_peer(peer_id);
        let deferred = lock(&self.backlog).remove(peer_id).map_or(0, |q| q.len());
        self.dispatcher.close_peer(peer_id);

        if had_session || transfers > 0 || deferred > 0 {
            tracing::debug!(
                "dropped session with {} ({} transfers, {} deferred)",
                peer_id,
                transfers,
                deferred
            );
        }
    }

    async fn handle_frame(&self, peer_id: &str, frame: InboundFrame) {
        let routed = {
            let mut registry = lock(&self.registry);
            route_inbound(&frame.bytes, |envelope| {
                registry.decrypt_from(peer_id, envelope, &mut EnvRng(&self.env))
            })
        };

        match routed {
            Ok(Routed::Control(message)) => {
                let peer_id = peer_id.to_string();
                self.process(MeshEvent::ControlReceived { peer_id, link: frame.link, message })
                    .await;
            },
            Ok(Routed::User { message, .. }) => {
                // Any user message proves the session is live, even if the
                // ratchet-init went out on a link that has since been replaced
                if !matches!(message, WireMessage::RatchetInit) {
                    self.flush_backlog(peer_id).await;
                }
                self.handle_user(peer_id, message).await;
            },
            Ok(Routed::Chunk(chunk)) => {
                let result = lock(&self.reassembler).accept_chunk(peer_id, chunk);
                self.reassembled(peer_id, result);
            },
            Err(e) => log_rejected(peer_id, &e),
        }
    }

    async fn handle_user(&self, peer_id: &str, message: WireMessage) {
        let from = peer_id.to_string();
        match message {
            WireMessage::RatchetInit => {
                tracing::debug!("{} primed our session", peer_id);
                self.session_ready(peer_id).await;
            },
            WireMessage::Message(message) => {
                let attachments = message.attachments.clone();
                let id = message.id.clone();
                self.notify(Notification::Message { from, message });
                self.link_attachments(peer_id, &id, &attachments);
            },
            WireMessage::EditMessage(message) => {
                let attachments = message.attachments.clone();
                let id = message.id.clone();
                self.notify(Notification::Edited { from, message });
                self.link_attachments(peer_id, &id, &attachments);
            },
            WireMessage::DeleteMessage(target) => {
                self.notify(Notification::Deleted { from, id: target.id });
            },
            WireMessage::Read(target) => self.notify(Notification::Read { from, id: target.id }),
            other => tracing::warn!("unexpected {} from {}", other.type_name(), peer_id),
        }
    }

    fn link_attachments(&self, peer_id: &str, message_id: &str, attachments: &[AttachmentRef]) {
        for attachment in attachments {
            let result = lock(&self.reassembler).link(peer_id, message_id, attachment);
            self.reassembled(peer_id, result);
        }
    }

    fn reassembled(&self, peer_id: &str, result: Result<Option<Reassembled>, ReassemblyError>) {
        match result {
            Ok(Some(attachment)) => {
                tracing::info!("received {} from {}", attachment.name, peer_id);
                self.notify(Notification::Attachment { from: peer_id.to_string(), attachment });
            },
            Ok(None) => {},
            Err(e) => tracing::warn!("transfer from {} rejected: {}", peer_id, e),
        }
    }

    fn notify(&self, notification: Notification) {
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn close_all(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }
}

fn log_rejected(peer_id: &str, error: &RouteError) {
    match error {
        RouteError::Session(SessionError::Ratchet(e)) if e.is_ordering() => {
            tracing::debug!("dropping frame from {}: {}", peer_id, error);
        },
        _ => tracing::warn!("dropping frame from {}: {}", peer_id, error),
    }
}

async fn drive<E: Environment>(
    shared: Arc<Shared<E>>,
    mut inputs: mpsc::UnboundedReceiver<Input>,
    mut incoming: mpsc::Receiver<IncomingLink>,
) {
    shared.process(MeshEvent::Start).await;

    let mut ticker = tokio::time::interval(shared.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            Some(input) = inputs.recv() => shared.handle_input(input).await,
            Some(accepted) = incoming.recv() => shared.accept(accepted).await,
            _ = ticker.tick() => shared.process(MeshEvent::Tick).await,
        }
    }
}

/// A running mesh node.
///
/// Dropping the node stops its driver and closes every link.
pub struct Node<E: Environment = SystemEnv> {
    shared: Arc<Shared<E>>,
    driver: JoinHandle<()>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Node<SystemEnv> {
    /// Start a node with the system clock and OS randomness.
    pub async fn spawn(
        config: NodeConfig,
        endpoint: Endpoint,
        directory: Arc<dyn KeyDirectory>,
    ) -> Self {
        Self::spawn_with_env(SystemEnv::new(), config, endpoint, directory).await
    }
}

impl<E: Environment> Node<E> {
    /// Start a node with a custom environment.
    ///
    /// Uses the configured identity or generates one, publishes it under the
    /// local user id and dials the anchor, if configured.
    pub async fn spawn_with_env(
        env: E,
        config: NodeConfig,
        endpoint: Endpoint,
        directory: Arc<dyn KeyDirectory>,
    ) -> Self {
        let identity = match config.identity.clone() {
            Some(identity) => identity,
            None => {
                tracing::debug!("no stored identity for {}, generating", config.local.device_id);
                IdentityKeyPair::generate(&mut EnvRng(&env))
            },
        };
        let public_key = identity.public_key();
        directory.publish(&config.local.user_id, public_key).await;

        let registry = SessionRegistry::new(
            config.local.peer_id.clone(),
            config.session_id.clone(),
            identity,
        );
        let coordinator = MeshCoordinator::new(
            env.clone(),
            config.local.clone(),
            config.anchor.clone(),
            config.mesh.clone(),
        );

        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let Endpoint { connector, incoming } = endpoint;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<E>>| {
            let weak = weak.clone();
            let dispatcher = InboundDispatcher::new(move |peer_id: String, frame: InboundFrame| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_frame(&peer_id, frame).await;
                    }
                }
            });

            Shared {
                env,
                broadcaster: Broadcaster::new(config.broadcast.clone()),
                config,
                coordinator: Mutex::new(coordinator),
                registry: Mutex::new(registry),
                reassembler: Mutex::new(ChunkReassembler::default()),
                channels: Mutex::new(HashMap::new()),
                backlog: Mutex::new(HashMap::new()),
                dispatcher,
                connector,
                directory,
                inputs,
                notifications,
            }
        });

        tracing::info!("node {} started", shared.config.local.peer_id);
        let driver = tokio::spawn(drive(Arc::clone(&shared), input_rx, incoming));

        Self { shared, driver, notifications: Some(notification_rx), public_key }
    }

    /// Our connection identifier.
    pub fn peer_id(&self) -> &str {
        &self.shared.config.local.peer_id
    }

    /// Identity key published for our user.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key
    }

    /// Take the notification stream. Returns `None` after the first call.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// Peers with an open link.
    pub fn connected_peers(&self) -> Vec<String> {
        lock(&self.shared.coordinator).connected_peers()
    }

    /// Snapshot of the member table.
    pub fn roster(&self) -> Vec<Member> {
        lock(&self.shared.coordinator).roster().iter().cloned().collect()
    }

    /// True if user messages to `peer_id` are sealed immediately.
    pub fn session_ready(&self, peer_id: &str) -> bool {
        lock(&self.shared.registry).resolve(peer_id) == SessionLookup::Ready
    }

    /// Send `message` to every connected peer.
    ///
    /// User messages are sealed per peer (or deferred until the peer's
    /// session is ready); control messages go in the clear. Each peer's
    /// outcome is independent.
    pub async fn broadcast(&self, message: &WireMessage) -> Vec<(String, SendOutcome)> {
        let peers = self.shared.open_peers();
        self.shared.fan_out(&peers, message).await
    }

    /// Broadcast a new chat message.
    pub async fn send_text(&self, text: &str) -> (ChatMessage, Vec<(String, SendOutcome)>) {
        let message = self.chat_message(text, Vec::new());
        let outcomes = self.broadcast(&WireMessage::Message(message.clone())).await;
        (message, outcomes)
    }

    /// Seal `data` with a fresh attachment key, announce it in a chat message
    /// and stream the chunks to every peer the message reached or is queued
    /// for.
    ///
    /// # Errors
    ///
    /// - `Attachment` if the configured chunk size is zero
    /// - `Protocol` if a chunk frame cannot be encoded
    pub async fn send_file(
        &self,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(ChatMessage, Vec<(String, SendOutcome)>), NodeError> {
        let env = &self.shared.env;
        let key = AttachmentKey::generate(&mut EnvRng(env));
        let blob = encrypt_attachment(&key, data, &mut EnvRng(env));
        let chunks = split_chunks(&blob, self.shared.config.chunk_size)?;

        let file_id = env.random_id();
        let total_chunks = chunks.len() as u32;
        let frames = chunks
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                WireMessage::FileChunk(FileChunk {
                    file_id: file_id.clone(),
                    chunk_index: index as u32,
                    total_chunks,
                    data,
                })
                .encode()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attachment = AttachmentRef {
            file_id,
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size: data.len() as u64,
            total_chunks,
            key: key.to_bytes(),
        };
        let message = self.chat_message("", vec![attachment]);

        let peers = self.shared.open_peers();
        let announced =
            self.shared.fan_out(&peers, &WireMessage::Message(message.clone())).await;

        let broadcaster = &self.shared.broadcaster;
        let frames = &frames;
        let streams = peers.iter().zip(announced).map(|((_, channel), (peer_id, outcome))| {
            async move {
                if matches!(outcome, SendOutcome::Dropped(_)) {
                    return (peer_id, outcome);
                }
                match broadcaster.send_all(channel.as_ref(), frames).await {
                    Ok(()) => (peer_id, outcome),
                    Err(e) => {
                        tracing::warn!("chunks to {} interrupted: {}", peer_id, e);
                        (peer_id, SendOutcome::Dropped(e.to_string()))
                    },
                }
            }
        });

        Ok((message, join_all(streams).await))
    }

    /// Stop the driver and close every link.
    pub async fn shutdown(mut self) {
        self.driver.abort();
        let _ = (&mut self.driver).await;
        self.shared.close_all();
        tracing::info!("node {} stopped", self.peer_id());
    }

    fn chat_message(&self, text: &str, attachments: Vec<AttachmentRef>) -> ChatMessage {
        ChatMessage {
            id: self.shared.env.random_id(),
            sender_id: self.peer_id().to_string(),
            text: text.to_string(),
            timestamp: self.shared.env.wall_clock_millis(),
            reply_to: None,
            attachments,
            is_edited: false,
            existing_file_ids: Vec::new(),
        }
    }
}

impl<E: Environment> Drop for Node<E> {
    fn drop(&mut self) {
        self.driver.abort();
        self.shared.close_all();
    }
}

impl<E: Environment> std::fmt::Debug for Node<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("peer_id", &self.peer_id()).finish_non_exhaustive()
    }
}
