//! # folio-collab: real-time collaborative rich-text editing
//!
//! Every participant holds a full CRDT replica of the document. Edits apply
//! locally at once and travel as operations through a relay; replicas that
//! received the same set of operations materialize identical content.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   InputEvent    ┌────────────────┐
//! │  EditorView   │ ──────────────► │ SurfaceAdapter │
//! │ (host widget) │ ◄────────────── │ (undo, cursor) │
//! └───────────────┘    ViewPatch    └───────┬────────┘
//!                                           │ Edit
//!                                           ▼
//! ┌───────────────┐   Operation     ┌────────────────┐   snapshot   ┌───────────────┐
//! │   Transport   │ ◄─────────────► │ EditorSession  │ ───────────► │ SnapshotStore │
//! │ (ws / memory) │   SyncMessage   │                │              │ (RocksDB, ..) │
//! └───────┬───────┘                 └───────┬────────┘              └───────────────┘
//!         │                                 │
//!         ▼                         ┌───────┴────────┐
//! ┌───────────────┐                 │ ReplicaStore   │  AwarenessTracker
//! │  SyncServer   │                 │ (Yrs Doc)      │  (cursors, colors)
//! │ (relay rooms) │                 └────────────────┘
//! └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: CRDT document store with a causal buffer
//! - [`markup`]: rich-text model and the canonical HTML subset
//! - [`awareness`]: presence records, liveness and color policy
//! - [`transport`]: the `Transport` seam with WebSocket and in-process backends
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: room fan-out for the relay
//! - [`server`]: WebSocket relay with persistence
//! - [`surface`]: editor view adapter with local undo
//! - [`persistence`]: snapshot stores and the save bridge
//! - [`storage`]: RocksDB document store
//! - [`session`]: the per-editor orchestrator
//! - [`share`]: shareable room links

pub mod awareness;
pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod markup;
pub mod persistence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod share;
pub mod storage;
pub mod surface;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    ActiveUser, AwarenessTracker, AwarenessUpdate, ColorPolicy, CursorRange, PresenceChange,
    PresenceState, UserIdentity,
};
pub use backoff::Backoff;
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use config::{
    AwarenessConfig, CollabConfig, PersistenceConfig, ReplicaConfig, ShareConfig,
    TransportConfig,
};
pub use error::{CollabError, CollabResult, PersistenceError};
pub use markup::{Mark, Marks, RichText, Span};
pub use persistence::{
    CallbackStore, MemorySnapshotStore, PersistedSnapshot, PersistenceBridge, SnapshotStore,
};
pub use protocol::{JoinRequest, MessageType, PeerId, PeerInfo, ProtocolError, SyncMessage};
pub use replica::{ChangeOrigin, Edit, MergeOutcome, Operation, ReplicaChange, ReplicaStore};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{EditorSession, SessionEvent, SessionParams};
pub use share::ShareLink;
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
pub use surface::{BufferView, EditorView, InputEvent, InputOutcome, SurfaceAdapter, ViewPatch};
pub use transport::{
    ConnectionState, LocalRelay, MemoryTransport, Transport, TransportEvent, WsTransport,
};
