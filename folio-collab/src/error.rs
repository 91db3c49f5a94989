//! Error taxonomy for the collaboration core.
//!
//! None of these are fatal to an editing session. Connection errors turn
//! into state indicators, deferred merges into a full resync, persistence
//! errors into warnings surfaced to the host.

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Top-level error for session, replica and transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    /// Signaling or relay unreachable. The transport keeps retrying.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operations are waiting on causal dependencies that have not arrived.
    ///
    /// Only returned once buffering exceeds its bound or stalls; the caller
    /// is expected to request a full-state resync.
    #[error("merge deferred: {pending} operation(s) awaiting dependencies")]
    MergeDeferred {
        pending: usize,
        resync_required: bool,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A remote operation or state update could not be integrated.
    #[error("replica error: {0}")]
    Replica(String),

    /// Local input was rejected because the surface is read-only.
    #[error("document is read-only")]
    ReadOnly,

    #[error("configuration error: {0}")]
    Config(String),

    /// The host view failed to mount or render.
    #[error("view error: {0}")]
    View(String),
}

/// Durable storage failures. Always non-fatal to editing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence timed out after {0} ms")]
    Timeout(u64),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("save failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DeserializationError(msg) | StoreError::CompressionError(msg) => {
                PersistenceError::Corrupt(msg)
            }
            other => PersistenceError::Backend(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type CollabResult<T> = Result<T, CollabError>;
