//! Binary protocol for replica synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id  │ doc_id   │ clock    │ target   │ payload  │
//! │ 1 byte   │ 16 bytes │ varint+n │ varint   │ 0|1+16   │ variable │
//! └──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type:
//! - `SyncStep1` : encoded v1 state vector of the sender
//! - `SyncStep2` : v1 update holding everything the requester lacks
//! - `Operation` : bincode [`Operation`]
//! - `Awareness` : bincode [`AwarenessUpdate`](crate::awareness::AwarenessUpdate)
//! - `PeerJoined`: bincode [`JoinRequest`]
//! - `PeerLeft`, `Ping`, `Pong`: empty
//!
//! A message with a `target` is meant for that peer only; everyone else
//! drops it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::replica::Operation;

/// Mask keeping replica client ids within 53 bits.
const CLIENT_ID_MASK: u64 = (1 << 53) - 1;

/// Client id the seed `canonical_html` is written under.
///
/// Identical seeds share an id and dedupe on merge. Different seeds get
/// different ids, so their items never collide.
pub fn seed_client_id(canonical_html: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"folio-seed\0");
    hasher.update(canonical_html.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(head) & CLIENT_ID_MASK {
        0 => 1,
        id => id,
    }
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector for the sync handshake
    SyncStep1 = 1,
    /// State diff response
    SyncStep2 = 2,
    /// Incremental replica operation
    Operation = 3,
    /// Presence update
    Awareness = 4,
    /// Peer joined (first message on a connection)
    PeerJoined = 5,
    /// Peer left
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Stable transport identity of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The relay's identity.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Replica client id used for item ids and the concurrent-insert tie-break.
    ///
    /// Low 53 bits of the UUID, never zero.
    pub fn client_id(&self) -> u64 {
        match (self.0.as_u128() as u64) & CLIENT_ID_MASK {
            0 => 1,
            id => id,
        }
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub name: String,
    pub avatar: Option<String>,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(PeerId::new(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            avatar: None,
        }
    }
}

/// Join payload: who is joining and which room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub info: PeerInfo,
    pub room_token: String,
}

/// Room address derived from the document id and the shared secret.
///
/// Peers holding different secrets for the same document never meet.
pub fn room_token(doc_id: &str, room_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(room_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: PeerId,
    pub doc_id: String,
    /// Lamport clock of the sender
    pub clock: u64,
    /// Intended recipient; `None` means the whole room
    pub target: Option<PeerId>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn raw(msg_type: MessageType, peer_id: PeerId, doc_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock: 0,
            target: None,
            payload,
        }
    }

    /// Wrap a replica operation.
    pub fn operation(doc_id: &str, op: &Operation) -> Result<Self, ProtocolError> {
        let mut msg = Self::raw(MessageType::Operation, op.origin, doc_id, encode_payload(op)?);
        msg.clock = op.clock;
        Ok(msg)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: PeerId, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep1, peer_id, doc_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: PeerId, doc_id: &str, state_diff: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep2, peer_id, doc_id, state_diff)
    }

    /// Create an awareness message from an already-encoded update.
    pub fn awareness(peer_id: PeerId, doc_id: &str, clock: u64, update: Vec<u8>) -> Self {
        let mut msg = Self::raw(MessageType::Awareness, peer_id, doc_id, update);
        msg.clock = clock;
        msg
    }

    /// Create a join announcement.
    pub fn peer_joined(doc_id: &str, join: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::PeerJoined,
            join.info.peer_id,
            doc_id,
            encode_payload(join)?,
        ))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: PeerId, doc_id: &str) -> Self {
        Self::raw(MessageType::PeerLeft, peer_id, doc_id, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: PeerId) -> Self {
        Self::raw(MessageType::Ping, peer_id, "", Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: PeerId) -> Self {
        Self::raw(MessageType::Pong, peer_id, "", Vec::new())
    }

    /// Address this message to a single peer.
    pub fn to_peer(mut self, target: PeerId) -> Self {
        self.target = Some(target);
        self
    }

    /// Whether `peer` should process this message.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.peer_id != peer && self.target.map_or(true, |t| t == peer)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse operation payload.
    pub fn as_operation(&self) -> Result<Operation, ProtocolError> {
        self.expect_type(MessageType::Operation)?;
        decode_payload(&self.payload)
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect_type(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(())
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
