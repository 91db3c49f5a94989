//! WebSocket relay with room-based document routing.
//!
//! ```text
//! Client A ──┐ ws://relay/{room_token}
//!            ├── Room ("{doc_id}#{room_token}") ── ReplicaStore ── BroadcastGroup
//! Client B ──┘                 │
//!                              ├── DocumentStore (RocksDB)
//!                              │     ├── op log while the room is live
//!                              │     └── snapshot once it empties
//!                   ┌──────────┼───────────┐
//!                   ▼          ▼           ▼
//!                Client A   Client B    Client C
//! ```
//!
//! The relay keeps its own replica of every live room so it can answer
//! `SyncStep1` for peers that reconnect after everyone else left. It never
//! edits; it only merges and forwards.

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::config::ReplicaConfig;
use crate::error::CollabError;
use crate::protocol::{MessageType, PeerId, SyncMessage};
use crate::replica::{MergeOutcome, ReplicaStore};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Drop connections silent for twice this long
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Causal buffer limits for room replicas
    pub replica: ReplicaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            replica: ReplicaConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CollabError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(CollabError::Config(format!(
                "bind_addr {:?} is not a socket address",
                self.bind_addr
            )));
        }
        if self.max_peers_per_room == 0 {
            return Err(CollabError::Config("max_peers_per_room must be at least 1".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(CollabError::Config("broadcast_capacity must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(CollabError::Config("heartbeat_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(2))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    pub storage_bytes: u64,
}

/// Storage and routing key of a room.
pub fn room_key(doc_id: &str, room_token: &str) -> String {
    format!("{doc_id}#{room_token}")
}

/// Live room: relay replica plus fan-out group.
struct DocumentRoom {
    key: String,
    replica: Mutex<ReplicaStore>,
    broadcast: Arc<BroadcastGroup>,
    next_version: AtomicU64,
}

impl DocumentRoom {
    fn new(key: String, doc_id: &str, config: &ServerConfig) -> Self {
        let mut replica = ReplicaStore::new(PeerId::nil(), config.replica.clone());
        // An empty seed only binds the id
        if let Err(e) = replica.initialize(doc_id, "") {
            log::warn!("Binding relay replica for {key} failed: {e}");
        }
        Self {
            key,
            replica: Mutex::new(replica),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            next_version: AtomicU64::new(1),
        }
    }

    fn replica(&self) -> MutexGuard<'_, ReplicaStore> {
        self.replica.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the last snapshot and replay the op log written after it.
    fn restore(&self, store: &DocumentStore) -> Result<bool, StoreError> {
        let mut replica = self.replica();
        let mut restored = false;
        match store.load_snapshot(&self.key) {
            Ok(snapshot) => match replica.restore(&snapshot.state) {
                Ok(()) => restored = true,
                Err(e) => log::warn!("Snapshot for room {} is unusable: {e}", self.key),
            },
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let deltas = store.load_all_deltas(&self.key)?;
        for (version, update) in &deltas {
            if let Err(e) = replica.apply_state_update(update) {
                log::warn!("Skipping op-log entry {version} of room {}: {e}", self.key);
            }
        }
        restored |= !deltas.is_empty();

        let last = match store.load_metadata(&self.key) {
            Ok(meta) => meta.version,
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        self.next_version.store(last + 1, Ordering::SeqCst);
        Ok(restored)
    }
}

type Rooms = Arc<RwLock<HashMap<String, Arc<DocumentRoom>>>>;

/// State shared by every connection task.
#[derive(Clone)]
struct RelayContext {
    config: ServerConfig,
    rooms: Rooms,
    /// Serializes room loads and closing snapshots
    room_io: Arc<tokio::sync::Mutex<()>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<DocumentStore>>,
}

impl RelayContext {
    async fn open_room(&self, doc_id: &str, room_token: &str) -> Arc<DocumentRoom> {
        let key = room_key(doc_id, room_token);
        if let Some(room) = self.rooms.read().await.get(&key) {
            return room.clone();
        }

        // Rooms are only inserted under room_io, so one recheck suffices
        let _io = self.room_io.lock().await;
        if let Some(room) = self.rooms.read().await.get(&key) {
            return room.clone();
        }
        let room = Arc::new(DocumentRoom::new(key.clone(), doc_id, &self.config));
        if let Some(store) = &self.store {
            let (loading, store) = (room.clone(), store.clone());
            match tokio::task::spawn_blocking(move || loading.restore(&store)).await {
                Ok(Ok(true)) => log::info!("Loaded persisted state for room {key}"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => log::error!("Failed to load room {key}: {e}"),
                Err(e) => log::error!("Loading room {key} did not complete: {e}"),
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms.insert(key, room.clone());
        self.stats.write().await.active_rooms = rooms.len();
        room
    }

    async fn persist_update(&self, room: &DocumentRoom, update: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        let version = room.next_version.fetch_add(1, Ordering::SeqCst);
        match store.store_delta(&room.key, version, update) {
            Ok(bytes) => {
                let mut stats = self.stats.write().await;
                stats.persisted_deltas += 1;
                stats.storage_bytes += bytes;
            }
            Err(e) => log::error!("Failed to persist op for room {}: {e}", room.key),
        }
    }

    /// Drop the room once its last peer has left, then snapshot it.
    ///
    /// Storage I/O runs on the blocking pool after the rooms lock is
    /// released. `room_io` stays held so a reopen waits for the snapshot.
    async fn close_room_if_empty(&self, room: &DocumentRoom) {
        let _io = self.room_io.lock().await;
        {
            let mut rooms = self.rooms.write().await;
            if room.broadcast.peer_count().await > 0 {
                return;
            }
            let live = rooms
                .get(&room.key)
                .is_some_and(|r| std::ptr::eq(Arc::as_ptr(r), room));
            if !live {
                return;
            }
            rooms.remove(&room.key);
            self.stats.write().await.active_rooms = rooms.len();
        }
        log::info!("Room {} removed (empty)", room.key);

        let Some(store) = &self.store else {
            return;
        };
        let mut snapshot = room.replica().snapshot();
        snapshot.doc_id = room.key.clone();
        let up_to = room.next_version.load(Ordering::SeqCst).saturating_sub(1);
        let (store, key) = (store.clone(), room.key.clone());
        let saved = tokio::task::spawn_blocking(move || {
            let meta = store.save_snapshot(&snapshot)?;
            if let Err(e) = store.compact_deltas(&key, up_to) {
                log::warn!("Op-log compaction failed for room {key}: {e}");
            }
            Ok::<_, StoreError>(meta)
        })
        .await;
        match saved {
            Ok(Ok(meta)) => {
                let mut stats = self.stats.write().await;
                stats.persisted_snapshots += 1;
                stats.storage_bytes += meta.compressed_size;
                log::info!("Persisted snapshot for room {} (room closing)", room.key);
            }
            Ok(Err(e)) => log::error!("Failed to persist snapshot for room {}: {e}", room.key),
            Err(e) => log::error!("Snapshot of room {} did not complete: {e}", room.key),
        }
    }
}

/// The relay server.
pub struct SyncServer {
    relay: RelayContext,
}

impl SyncServer {
    /// Create a relay, opening storage when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, CollabError> {
        config.validate()?;
        let store = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })
                .map_err(|e| CollabError::Persistence(e.into()))?;
                Some(Arc::new(store))
            }
            None => None,
        };
        Ok(Self {
            relay: RelayContext {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                room_io: Arc::default(),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
            },
        })
    }

    /// In-memory relay on the default address.
    pub fn with_defaults() -> Self {
        Self {
            relay: RelayContext {
                config: ServerConfig::default(),
                rooms: Arc::new(RwLock::new(HashMap::new())),
                room_io: Arc::default(),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store: None,
            },
        }
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, CollabError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Load every persisted room so reconnecting peers find it ready.
    pub async fn recover(&self) -> Result<usize, CollabError> {
        let Some(store) = &self.relay.store else {
            return Ok(0);
        };
        let keys = store
            .list_documents()
            .map_err(|e| CollabError::Persistence(e.into()))?;

        let mut recovered = 0;
        for key in &keys {
            let Some((doc_id, token)) = key.rsplit_once('#') else {
                log::debug!("Skipping non-room document {key}");
                continue;
            };
            self.relay.open_room(doc_id, token).await;
            recovered += 1;
        }
        log::info!("Recovery complete: {recovered}/{} rooms restored", keys.len());
        Ok(recovered)
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }
        log::info!("Sync relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, relay).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.relay.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.relay.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.relay.config
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.relay.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.relay.rooms.read().await.len()
    }

    /// Materialized content of a live room.
    pub async fn room_content(&self, doc_id: &str, room_token: &str) -> Option<String> {
        let rooms = self.relay.rooms.read().await;
        let room = rooms.get(&room_key(doc_id, room_token))?;
        let content = room.replica().materialize();
        Some(content)
    }
}

async fn send_msg<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

/// Serve one WebSocket peer for its whole lifetime.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: RelayContext) -> Result<(), BoxError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().trim_start_matches('/').to_string();
        Ok::<_, ErrorResponse>(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket handshake with {addr} for /{path}");

    // First frame must announce the peer
    let join_msg = loop {
        match tokio::time::timeout(JOIN_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                let bytes: Vec<u8> = data.into();
                break SyncMessage::decode(&bytes)?;
            }
            Ok(Some(Ok(Message::Ping(data)))) => ws_sender.send(Message::Pong(data)).await?,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Ok(()),
            Err(_) => return Err(format!("{addr} sent no join within {JOIN_TIMEOUT:?}").into()),
        }
    };
    let join = join_msg.join_request()?;
    if !path.is_empty() && path != join.room_token {
        relay.stats.write().await.rejected_connections += 1;
        let _ = ws_sender.close().await;
        return Err(format!("{addr} joined with a token that does not match its URL").into());
    }
    let peer = join.info.peer_id;
    let doc_id = join_msg.doc_id.clone();

    let room = relay.open_room(&doc_id, &join.room_token).await;
    if room.broadcast.peer_count().await >= relay.config.max_peers_per_room {
        relay.stats.write().await.rejected_connections += 1;
        log::warn!("Room {} is full; rejecting {}", room.key, join.info.name);
        let _ = ws_sender.close().await;
        relay.close_room_if_empty(&room).await;
        return Ok(());
    }
    let mut broadcast_rx = room.broadcast.add_peer(join.info.clone()).await;
    {
        let mut s = relay.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    if let Some(store) = &relay.store {
        if let Err(e) = store.put_document_info(&room.key, None, &[join.info.name.clone()]) {
            log::warn!("Could not record collaborator for room {}: {e}", room.key);
        }
    }
    log::info!("Peer {} ({peer}) joined room {}", join.info.name, room.key);

    // Ask for anything the peer has that the relay lacks
    let sv = room.replica().state_vector();
    send_msg(&mut ws_sender, &SyncMessage::sync_step1(PeerId::nil(), &doc_id, sv).to_peer(peer)).await?;
    let _ = room.broadcast.broadcast(&join_msg);

    let idle_timeout = relay.config.idle_timeout();
    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                inbound = tokio::time::timeout(idle_timeout, ws_receiver.next()) => {
                    let frame = match inbound {
                        Ok(frame) => frame,
                        Err(_) => {
                            log::info!("Peer {peer} idle for {idle_timeout:?}; dropping");
                            return Ok(());
                        }
                    };
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = relay.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match SyncMessage::decode(&bytes) {
                                Ok(msg) if msg.peer_id != peer => {
                                    log::warn!("Peer {peer} sent a frame claiming to be {}", msg.peer_id);
                                }
                                Ok(msg) => {
                                    handle_frame(&relay, &room, &mut ws_sender, msg, bytes).await?;
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                frame = broadcast_rx.recv() => match frame {
                    Ok(frame) => {
                        if frame.is_for(peer) {
                            ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        room.broadcast.record_dropped(n);
                        log::warn!("Peer {peer} lagged by {n} frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
    .await;

    // Cleanup runs on every exit path
    if room.broadcast.remove_peer(&peer).await.is_some() {
        let _ = room.broadcast.broadcast(&SyncMessage::peer_left(peer, &doc_id));
    }
    relay.close_room_if_empty(&room).await;
    {
        let mut s = relay.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    log::info!("Peer {peer} left room {}", room.key);
    result
}

/// Merge what the relay can use and forward the rest.
async fn handle_frame<S>(
    relay: &RelayContext,
    room: &DocumentRoom,
    ws_sender: &mut S,
    msg: SyncMessage,
    bytes: Vec<u8>,
) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let to_relay = msg.target == Some(PeerId::nil());
    let forward = RoomFrame {
        from: msg.peer_id,
        target: msg.target,
        bytes: Arc::new(bytes),
    };

    match msg.msg_type {
        MessageType::Operation => {
            let op = msg.as_operation()?;
            let update = op.update.clone();
            let outcome = room.replica().apply_remote_change(op);
            match outcome {
                Ok(MergeOutcome::Duplicate) => {
                    log::trace!("Dropping duplicate op from {}", msg.peer_id);
                    return Ok(());
                }
                Ok(_) => relay.persist_update(room, &update).await,
                Err(CollabError::MergeDeferred { .. }) => {
                    relay.persist_update(room, &update).await;
                    let sv = room.replica().state_vector();
                    let resync = SyncMessage::sync_step1(PeerId::nil(), &msg.doc_id, sv).to_peer(msg.peer_id);
                    send_msg(ws_sender, &resync).await?;
                }
                Err(e) => {
                    log::warn!("Rejected op from {}: {e}", msg.peer_id);
                    return Ok(());
                }
            }
            room.broadcast.broadcast_frame(forward);
        }
        MessageType::SyncStep1 => {
            if msg.target.is_none() || to_relay {
                let diff = room.replica().diff_since(&msg.payload);
                match diff {
                    Ok(diff) => {
                        let reply = SyncMessage::sync_step2(PeerId::nil(), &msg.doc_id, diff).to_peer(msg.peer_id);
                        send_msg(ws_sender, &reply).await?;
                    }
                    Err(e) => log::warn!("Bad state vector from {}: {e}", msg.peer_id),
                }
            }
            if !to_relay {
                room.broadcast.broadcast_frame(forward);
            }
        }
        MessageType::SyncStep2 => {
            let applied = room.replica().apply_state_update(&msg.payload);
            match applied {
                Ok(_) => relay.persist_update(room, &msg.payload).await,
                Err(e) => log::warn!("Rejected state from {}: {e}", msg.peer_id),
            }
            if !to_relay {
                room.broadcast.broadcast_frame(forward);
            }
        }
        MessageType::Awareness => {
            log::trace!("Presence update from {} in room {}", msg.peer_id, room.key);
            room.broadcast.broadcast_frame(forward);
        }
        MessageType::PeerLeft => {
            if room.broadcast.remove_peer(&msg.peer_id).await.is_some() {
                room.broadcast.broadcast_frame(forward);
            }
        }
        MessageType::Ping => {
            send_msg(ws_sender, &SyncMessage::pong(PeerId::nil())).await?;
        }
        MessageType::Pong | MessageType::PeerJoined => {
            log::debug!("Ignoring {:?} from {}", msg.msg_type, msg.peer_id);
        }
    }
    Ok(())
}
