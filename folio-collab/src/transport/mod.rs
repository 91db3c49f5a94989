//! Room-scoped message transport between replicas.
//!
//! ```text
//!              connect()
//! Disconnected ─────────► Connecting ──ok──► Connected
//!      ▲                      │                │   ▲
//!      │ disconnect()         │ timeout/err    │   │ reconnect ok
//!      │                      ▼   lost/idle    ▼   │
//!      └──────────────── Reconnecting ◄────────────┘
//!                        (exponential backoff)
//! ```
//!
//! A supervisor task owns the link. The transport handle only talks to it
//! over channels, so `broadcast` never blocks and teardown is a signal
//! plus a join. Implementations differ in how a link is opened:
//!
//! - [`WsTransport`](ws::WsTransport): WebSocket to a relay server
//! - [`MemoryTransport`](memory::MemoryTransport): in-process [`LocalRelay`](memory::LocalRelay)

pub mod memory;
pub mod ws;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::error::CollabError;
use crate::protocol::{room_token, JoinRequest, MessageType, PeerId, PeerInfo, SyncMessage};

pub use memory::{LocalRelay, MemoryTransport};
pub use ws::WsTransport;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events delivered to the session loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Inbound message addressed to this peer
    Message(SyncMessage),
    /// A connect attempt failed or an established link was lost
    ConnectionError(String),
    /// `max_retries` consecutive failures; parked until `disconnect`
    RetriesExhausted,
}

/// Room-scoped, best-effort message delivery.
pub trait Transport: Send {
    /// Join the room for `doc_id`. The first attempt runs before this
    /// returns; on failure the transport keeps retrying in the background.
    fn connect(
        &mut self,
        doc_id: &str,
        room_secret: &str,
    ) -> impl Future<Output = Result<(), CollabError>> + Send;

    /// Send to every peer in the room. While offline, operations are
    /// queued for replay and everything else is dropped.
    fn broadcast(&self, msg: SyncMessage) -> Result<(), CollabError>;

    /// Inbound events. Can only be taken once.
    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    fn state(&self) -> ConnectionState;

    fn peer_id(&self) -> PeerId;

    /// Stop the supervisor and wait for it to exit.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Operations written while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedMessage>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    msg: SyncMessage,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message for later replay. Returns false when full.
    pub fn enqueue(&mut self, msg: SyncMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedMessage {
            msg,
            queued_at: Instant::now(),
        });
        true
    }

    /// Put a message that failed to send back at the front.
    pub fn requeue(&mut self, msg: SyncMessage) {
        self.queue.push_front(QueuedMessage {
            msg,
            queued_at: Instant::now(),
        });
    }

    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.queue.drain(..).map(|q| q.msg).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.msg.payload.len()).sum()
    }

    /// How long the oldest entry has been waiting.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

// ───────────────────────────────────────────────────────────────────
// Link abstraction
// ───────────────────────────────────────────────────────────────────

/// Opens one link to the room, sending `join` as its first frame.
pub(crate) trait Connector: Send + 'static {
    type Sink: LinkSink;
    type Stream: LinkStream;

    fn open(
        &mut self,
        join: &SyncMessage,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Stream), String>> + Send;
}

pub(crate) trait LinkSink: Send + 'static {
    fn send_msg(&mut self, msg: &SyncMessage) -> impl Future<Output = Result<(), String>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub(crate) trait LinkStream: Send + 'static {
    /// Next frame; `None` when the link closed.
    fn recv_msg(&mut self) -> impl Future<Output = Option<Result<SyncMessage, String>>> + Send;
}

// ───────────────────────────────────────────────────────────────────
// Shared handle + supervisor
// ───────────────────────────────────────────────────────────────────

/// State shared by every transport implementation.
pub(crate) struct TransportCore {
    peer: PeerInfo,
    config: TransportConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    outbound_tx: Option<mpsc::UnboundedSender<SyncMessage>>,
    queue: Arc<Mutex<OfflineQueue>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TransportCore {
    pub(crate) fn new(peer: PeerInfo, config: TransportConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let queue = OfflineQueue::new(config.offline_queue_size);
        Self {
            peer,
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            event_tx,
            event_rx: Some(event_rx),
            outbound_tx: None,
            queue: Arc::new(Mutex::new(queue)),
            shutdown: None,
            task: None,
        }
    }

    pub(crate) fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Spawn the supervisor and wait for the outcome of its first attempt.
    pub(crate) async fn start<C: Connector>(
        &mut self,
        connector: C,
        doc_id: &str,
        room_secret: &str,
    ) -> Result<(), CollabError> {
        if self.task.is_some() {
            return Err(CollabError::Connection("transport already started".into()));
        }
        let join = JoinRequest {
            info: self.peer.clone(),
            room_token: room_token(doc_id, room_secret),
        };
        let join_msg = SyncMessage::peer_joined(doc_id, &join)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();

        let supervisor = Supervisor {
            connector,
            peer: self.peer.peer_id,
            doc_id: doc_id.to_string(),
            join: join_msg,
            config: self.config.clone(),
            state: self.state_tx.clone(),
            events: self.event_tx.clone(),
            outbound: outbound_rx,
            queue: self.queue.clone(),
            shutdown: shutdown_rx,
        };
        self.shutdown = Some(shutdown_tx);
        self.outbound_tx = Some(outbound_tx);
        self.task = Some(tokio::spawn(supervisor.run(first_tx)));

        // The attempt itself is bounded by connect_timeout; the margin covers scheduling
        let wait = self.config.connect_timeout().saturating_mul(2);
        match tokio::time::timeout(wait, first_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(CollabError::Connection(reason)),
            Ok(Err(_)) => Err(CollabError::Connection("transport stopped".into())),
            Err(_) => Err(CollabError::Connection(format!(
                "first connect attempt did not finish within {} ms",
                wait.as_millis()
            ))),
        }
    }

    pub(crate) fn broadcast(&self, msg: SyncMessage) -> Result<(), CollabError> {
        let connected = self.state() == ConnectionState::Connected;
        if connected {
            if let Some(tx) = &self.outbound_tx {
                if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                    return self.queue_offline(msg);
                }
                return Ok(());
            }
        }
        self.queue_offline(msg)
    }

    fn queue_offline(&self, msg: SyncMessage) -> Result<(), CollabError> {
        match msg.msg_type {
            MessageType::Operation => {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                if !queue.enqueue(msg) {
                    return Err(CollabError::Connection(format!(
                        "offline queue full ({} operations)",
                        queue.len()
                    )));
                }
                Ok(())
            }
            // Presence and heartbeats are meaningless once stale
            _ => Ok(()),
        }
    }

    pub(crate) fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn offline_queue_len(&self) -> usize {
        self.queue.lock().map_or(0, |q| q.len())
    }

    pub(crate) async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.outbound_tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Transport supervisor for {} ended abnormally: {e}", self.peer.peer_id);
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for TransportCore {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

enum LinkEnd {
    Shutdown,
    Lost(String),
}

struct Supervisor<C: Connector> {
    connector: C,
    peer: PeerId,
    doc_id: String,
    join: SyncMessage,
    config: TransportConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<SyncMessage>,
    queue: Arc<Mutex<OfflineQueue>>,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, first: oneshot::Sender<Result<(), String>>) {
        let backoff = Backoff::from_millis(self.config.initial_backoff_ms, self.config.max_backoff_ms);
        let mut first = Some(first);
        let mut failures: u32 = 0;
        self.set_state(ConnectionState::Connecting).await;

        loop {
            let attempt = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                res = tokio::time::timeout(self.config.connect_timeout(), self.connector.open(&self.join)) => {
                    match res {
                        Ok(link) => link,
                        Err(_) => Err(format!(
                            "connect timed out after {} ms",
                            self.config.connect_timeout_ms
                        )),
                    }
                }
            };

            match attempt {
                Ok((sink, stream)) => {
                    failures = 0;
                    log::info!("Peer {} connected to room for {}", self.peer, self.doc_id);
                    // Report the first outcome before any event that could block on a full channel
                    let changed = self.swap_state(ConnectionState::Connected);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    if changed {
                        self.emit(TransportEvent::StateChanged(ConnectionState::Connected)).await;
                    }
                    match self.serve(sink, stream).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost(reason) => {
                            log::warn!("Peer {} lost link: {reason}", self.peer);
                            self.emit(TransportEvent::ConnectionError(reason)).await;
                            self.set_state(ConnectionState::Reconnecting).await;
                        }
                    }
                }
                Err(reason) => {
                    failures += 1;
                    log::warn!("Peer {} connect attempt {failures} failed: {reason}", self.peer);
                    let changed = self.swap_state(ConnectionState::Reconnecting);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(reason.clone()));
                    }
                    if changed {
                        self.emit(TransportEvent::StateChanged(ConnectionState::Reconnecting)).await;
                    }
                    self.emit(TransportEvent::ConnectionError(reason)).await;

                    if self.config.max_retries.is_some_and(|max| failures > max) {
                        log::error!("Peer {} giving up after {failures} attempts", self.peer);
                        self.emit(TransportEvent::RetriesExhausted).await;
                        stopped(&mut self.shutdown).await;
                        break;
                    }
                }
            }

            let delay = backoff.delay(failures.saturating_sub(1));
            log::debug!("Peer {} reconnecting in {delay:?}", self.peer);
            tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        log::info!("Peer {} transport stopped", self.peer);
    }

    /// Pump one established link until it fails or shutdown is signalled.
    async fn serve(&mut self, mut sink: C::Sink, mut stream: C::Stream) -> LinkEnd {
        let replay = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain()
        };
        if !replay.is_empty() {
            log::info!("Replaying {} queued operations", replay.len());
        }
        for (i, msg) in replay.iter().enumerate() {
            if let Err(e) = sink.send_msg(msg).await {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                for unsent in replay[i..].iter().rev() {
                    queue.requeue(unsent.clone());
                }
                return LinkEnd::Lost(e);
            }
        }

        let idle_timeout = self.config.idle_timeout();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => {
                    let _ = sink.send_msg(&SyncMessage::peer_left(self.peer, &self.doc_id)).await;
                    sink.close().await;
                    return LinkEnd::Shutdown;
                }
                inbound = stream.recv_msg() => match inbound {
                    Some(Ok(msg)) => {
                        last_inbound = Instant::now();
                        match msg.msg_type {
                            MessageType::Ping | MessageType::Pong => {}
                            _ if msg.is_for(self.peer) => {
                                self.emit(TransportEvent::Message(msg)).await;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => return LinkEnd::Lost(e),
                    None => return LinkEnd::Lost("link closed by remote".into()),
                },
                outbound = self.outbound.recv() => match outbound {
                    Some(msg) => {
                        if let Err(e) = sink.send_msg(&msg).await {
                            if msg.msg_type == MessageType::Operation {
                                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                                queue.requeue(msg);
                            }
                            return LinkEnd::Lost(e);
                        }
                    }
                    None => {
                        sink.close().await;
                        return LinkEnd::Shutdown;
                    }
                },
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= idle_timeout {
                        return LinkEnd::Lost(format!(
                            "no inbound frame for {} ms",
                            self.config.idle_timeout_ms
                        ));
                    }
                    if let Err(e) = sink.send_msg(&SyncMessage::ping(self.peer)).await {
                        return LinkEnd::Lost(e);
                    }
                }
            }
        }
    }

    async fn set_state(&mut self, next: ConnectionState) {
        if self.swap_state(next) {
            self.emit(TransportEvent::StateChanged(next)).await;
        }
    }

    /// Publish `next` to the watch channel. Returns whether it changed.
    fn swap_state(&self, next: ConnectionState) -> bool {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("Peer {} transport {prev:?} -> {next:?}", self.peer);
        }
        prev != next
    }

    /// Deliver an event unless shutdown is signalled first.
    async fn emit(&mut self, event: TransportEvent) {
        tokio::select! {
            _ = self.events.send(event) => {}
            _ = stopped(&mut self.shutdown) => {}
        }
    }
}

/// Resolves once shutdown is signalled or the handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
