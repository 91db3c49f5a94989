//! Persistence bridge between a live replica and durable storage.
//!
//! ```text
//! EditorSession ──note_edit──► PersistenceBridge ──spawn──► save task
//!       ▲                           │                          │ retry + timeout
//!       └──────── SaveReport ◄──────┴──────── mpsc ◄───────────┘
//! ```
//!
//! Saves never run on the session loop. Each attempt is bounded by
//! `save_timeout`, failed attempts back off, and only the final failure
//! is reported. A snapshot whose version was already saved is skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::backoff::Backoff;
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::storage::{DocumentStore, StoreError};

/// Durable projection of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub doc_id: String,
    /// Materialized HTML
    pub content: String,
    /// Version marker at save time (state vector plus delete set)
    pub version: Vec<u8>,
    /// Full replica state as one update
    pub state: Vec<u8>,
    /// Unix seconds
    pub saved_at: u64,
}

/// A place snapshots are loaded from and saved to.
pub trait SnapshotStore: Send + Sync + 'static {
    /// The last saved snapshot, or `None` for a new document.
    fn load(
        &self,
        doc_id: &str,
    ) -> impl Future<Output = Result<Option<PersistedSnapshot>, PersistenceError>> + Send;

    fn save(
        &self,
        snapshot: &PersistedSnapshot,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

impl<S: SnapshotStore> SnapshotStore for Arc<S> {
    fn load(
        &self,
        doc_id: &str,
    ) -> impl Future<Output = Result<Option<PersistedSnapshot>, PersistenceError>> + Send {
        (**self).load(doc_id)
    }

    fn save(
        &self,
        snapshot: &PersistedSnapshot,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        (**self).save(snapshot)
    }
}

impl SnapshotStore for DocumentStore {
    async fn load(&self, doc_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        match self.load_snapshot(doc_id) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        self.save_snapshot(snapshot)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    docs: Mutex<HashMap<String, PersistedSnapshot>>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    saves: AtomicU32,
}

/// In-memory store with failure and latency injection. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<MemoryInner>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves with a backend error.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every load and save by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u32 {
        self.inner.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, doc_id: &str) -> Option<PersistedSnapshot> {
        self.docs().get(doc_id).cloned()
    }

    pub fn insert(&self, snapshot: PersistedSnapshot) {
        self.docs().insert(snapshot.doc_id.clone(), snapshot);
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, HashMap<String, PersistedSnapshot>> {
        self.inner.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        let ms = self.inner.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, doc_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        self.simulate_latency().await;
        Ok(self.get(doc_id))
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        self.simulate_latency().await;
        let failing = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistenceError::Backend("injected failure".into()));
        }
        self.insert(snapshot.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type SaveCallback = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Forwards the serialized content of every save to a host callback.
///
/// Loads always return `None`; the host supplies initial content itself.
pub struct CallbackStore {
    on_save: SaveCallback,
}

impl CallbackStore {
    pub fn new<F>(on_save: F) -> Self
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            on_save: Box::new(on_save),
        }
    }
}

impl SnapshotStore for CallbackStore {
    async fn load(&self, _doc_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        Ok(None)
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        (self.on_save)(&snapshot.content).map_err(PersistenceError::Backend)
    }
}

/// Outcome of one background save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub doc_id: String,
    pub version: Vec<u8>,
    /// Attempts used on success, or the final error
    pub result: Result<u32, PersistenceError>,
}

/// Save scheduling and retry around a [`SnapshotStore`].
pub struct PersistenceBridge<S: SnapshotStore> {
    store: Arc<S>,
    config: PersistenceConfig,
    edits_since_save: u32,
    last_save_at: Instant,
    last_saved_version: Option<Vec<u8>>,
    in_flight: Option<Vec<u8>>,
    reports_tx: mpsc::UnboundedSender<SaveReport>,
    reports_rx: mpsc::UnboundedReceiver<SaveReport>,
}

impl<S: SnapshotStore> PersistenceBridge<S> {
    pub fn new(store: S, config: PersistenceConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    pub fn from_arc(store: Arc<S>, config: PersistenceConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            edits_since_save: 0,
            last_save_at: Instant::now(),
            last_saved_version: None,
            in_flight: None,
            reports_tx,
            reports_rx,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Load the last snapshot, retrying with backoff.
    ///
    /// A corrupt snapshot is reported at once; retrying cannot fix it.
    pub async fn load(&mut self, doc_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        let backoff = self.backoff();
        let timeout = self.config.save_timeout();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(timeout, self.store.load(doc_id)).await {
                Ok(Ok(snapshot)) => {
                    if let Some(snapshot) = &snapshot {
                        self.last_saved_version = Some(snapshot.version.clone());
                    }
                    return Ok(snapshot);
                }
                Ok(Err(e @ PersistenceError::Corrupt(_))) => return Err(e),
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = PersistenceError::Timeout(self.config.save_timeout_ms).to_string(),
            }
            log::warn!("Load of {doc_id} failed (attempt {attempt}/{max_attempts}): {last}");
            if attempt < max_attempts {
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
        }
        Err(PersistenceError::Exhausted {
            attempts: max_attempts,
            last,
        })
    }

    /// Count one local edit towards the save threshold.
    pub fn note_edit(&mut self) {
        self.edits_since_save = self.edits_since_save.saturating_add(1);
    }

    pub fn edits_since_save(&self) -> u32 {
        self.edits_since_save
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_saved_version(&self) -> Option<&[u8]> {
        self.last_saved_version.as_deref()
    }

    /// Whether a periodic save is due at `now`.
    pub fn should_save(&self, now: Instant) -> bool {
        if self.edits_since_save == 0 || self.in_flight.is_some() {
            return false;
        }
        self.edits_since_save >= self.config.edit_threshold
            || now.saturating_duration_since(self.last_save_at) >= self.config.save_interval()
    }

    /// Start a background save. Returns `false` when skipped because the
    /// version is already saved or being saved.
    pub fn begin_save(&mut self, snapshot: PersistedSnapshot) -> bool {
        if self.is_unchanged(&snapshot.version) {
            log::trace!("Skipping save of {}: version unchanged", snapshot.doc_id);
            self.edits_since_save = 0;
            return false;
        }
        self.in_flight = Some(snapshot.version.clone());
        self.edits_since_save = 0;
        self.last_save_at = Instant::now();

        let store = self.store.clone();
        let config = self.config.clone();
        let reports = self.reports_tx.clone();
        tokio::spawn(async move {
            let result = save_with_retry(store.as_ref(), &snapshot, &config).await;
            let _ = reports.send(SaveReport {
                doc_id: snapshot.doc_id,
                version: snapshot.version,
                result,
            });
        });
        true
    }

    /// Next finished background save. Cancel safe.
    pub async fn next_report(&mut self) -> Option<SaveReport> {
        let report = self.reports_rx.recv().await?;
        self.absorb(&report);
        Some(report)
    }

    /// Save now and wait for the result. Waits out an in-flight save first
    /// so an older snapshot never lands after a newer one.
    pub async fn save_and_wait(&mut self, snapshot: PersistedSnapshot) -> Result<bool, PersistenceError> {
        if self.in_flight.is_some() {
            if let Some(report) = self.reports_rx.recv().await {
                self.absorb(&report);
            }
        }
        if self.is_unchanged(&snapshot.version) {
            self.edits_since_save = 0;
            return Ok(false);
        }
        self.edits_since_save = 0;
        self.last_save_at = Instant::now();
        match save_with_retry(self.store.as_ref(), &snapshot, &self.config).await {
            Ok(_) => {
                self.last_saved_version = Some(snapshot.version);
                Ok(true)
            }
            Err(e) => {
                self.edits_since_save = 1;
                Err(e)
            }
        }
    }

    fn is_unchanged(&self, version: &[u8]) -> bool {
        self.last_saved_version.as_deref() == Some(version)
            || self.in_flight.as_deref() == Some(version)
    }

    fn absorb(&mut self, report: &SaveReport) {
        if self.in_flight.as_deref() == Some(report.version.as_slice()) {
            self.in_flight = None;
        }
        match &report.result {
            Ok(attempts) => {
                log::debug!("Saved {} after {attempts} attempt(s)", report.doc_id);
                self.last_saved_version = Some(report.version.clone());
            }
            Err(e) => {
                log::warn!("Save of {} failed: {e}", report.doc_id);
                // Still dirty: retry on the next interval
                self.edits_since_save = self.edits_since_save.max(1);
            }
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_millis(self.config.initial_backoff_ms, self.config.max_backoff_ms)
    }
}

async fn save_with_retry<S: SnapshotStore>(
    store: &S,
    snapshot: &PersistedSnapshot,
    config: &PersistenceConfig,
) -> Result<u32, PersistenceError> {
    let backoff = Backoff::from_millis(config.initial_backoff_ms, config.max_backoff_ms);
    let max_attempts = config.max_attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=max_attempts {
        match tokio::time::timeout(config.save_timeout(), store.save(snapshot)).await {
            Ok(Ok(())) => return Ok(attempt),
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = PersistenceError::Timeout(config.save_timeout_ms).to_string(),
        }
        log::warn!(
            "Save of {} failed (attempt {attempt}/{max_attempts}): {last}",
            snapshot.doc_id
        );
        if attempt < max_attempts {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
    }
    Err(PersistenceError::Exhausted {
        attempts: max_attempts,
        last,
    })
}
