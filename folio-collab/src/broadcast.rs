//! Per-room fan-out for the relay server.
//!
//! One tokio broadcast channel per room carries pre-encoded frames. Each
//! connection subscribes once and filters out frames not meant for it, so
//! a send is a single encode regardless of room size. Receivers that fall
//! more than `capacity` frames behind lose frames; the replica layer
//! detects the gap and resyncs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{PeerId, PeerInfo, ProtocolError, SyncMessage};

/// Frame as delivered to subscribers: sender, optional target, bytes.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub from: PeerId,
    pub target: Option<PeerId>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    /// Whether the connection for `peer` should forward this frame.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.from != peer && self.target.map_or(true, |t| t == peer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and subscribe it to the room.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RoomFrame> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and fan out. Returns the number of subscribers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = RoomFrame {
            from: msg.peer_id,
            target: msg.target,
            bytes: Arc::new(msg.encode()?),
        };
        Ok(self.broadcast_frame(frame))
    }

    pub fn broadcast_frame(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
