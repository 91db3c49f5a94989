//! Durable storage for documents.
//!
//! ```text
//! ┌──────────────────┐  snapshots   ┌───────────────┐
//! │ PersistenceBridge│ ───────────► │ DocumentStore │
//! └──────────────────┘              │ (RocksDB)     │
//! ┌──────────────────┐  op log      │               │
//! │ SyncServer rooms │ ───────────► │ documents     │
//! └──────────────────┘  + snapshots │ deltas        │
//!                                   │ metadata      │
//!                                   └───────────────┘
//! ```
//!
//! The relay appends every accepted operation to the op log and folds the
//! log into a snapshot when a room empties. On restart it restores the
//! snapshot and replays whatever log entries survived.

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
