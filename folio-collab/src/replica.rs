//! Document replica store.
//!
//! Wraps a `yrs` document holding a single `Text` named `content` and adds
//! the causal layer the relay protocol needs:
//!
//! ```text
//! local Edit ──► apply_local_change ──► Operation { deps, covers, update }
//!                                              │ broadcast
//!                                              ▼
//! remote Operation ──► apply_remote_change ──┬─► Duplicate   (covers already known)
//!                                            ├─► Applied     (deps satisfied, then drain)
//!                                            └─► Deferred    (buffered until deps arrive)
//! ```
//!
//! `deps` is the state vector the op was produced against and `covers` the
//! state vector right after it. An op whose `covers` is already dominated
//! by the local state is a duplicate; one whose `deps` is not is buffered.
//!
//! Concurrent inserts at the same position are ordered by ascending client
//! id, and a peer's client id derives from its [`PeerId`], so the order is
//! the same on every replica.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update,
    WriteTxn,
};

use crate::config::ReplicaConfig;
use crate::error::CollabError;
use crate::markup::{Mark, Marks, RichText};
use crate::persistence::PersistedSnapshot;
use crate::protocol::{seed_client_id, PeerId};

/// Root type name shared by every replica of a document.
pub const TEXT_NAME: &str = "content";

/// An atomic, immutable replica mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub origin: PeerId,
    /// Lamport clock of the origin when the op was produced
    pub clock: u64,
    /// Encoded state vector before the op
    pub deps: Vec<u8>,
    /// Encoded state vector after the op
    pub covers: Vec<u8>,
    /// v1 update bytes
    pub update: Vec<u8>,
}

/// A local edit in char coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Insert {
        index: usize,
        text: String,
        marks: Marks,
    },
    Delete {
        index: usize,
        len: usize,
    },
    Format {
        index: usize,
        len: usize,
        mark: Mark,
        enabled: bool,
    },
}

impl Edit {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            index,
            text: text.into(),
            marks: Marks::plain(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        Edit::Delete { index, len }
    }

    pub fn format(index: usize, len: usize, mark: Mark, enabled: bool) -> Self {
        Edit::Format {
            index,
            len,
            mark,
            enabled,
        }
    }
}

/// Result of a local change.
#[derive(Debug, Clone)]
pub struct LocalChange {
    /// The op to broadcast; `None` when the edit changed nothing
    pub op: Option<Operation>,
    /// Materialized content after the change
    pub content: String,
}

/// Result of integrating a remote op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Integrated, plus `drained` buffered ops that became ready
    Applied { drained: usize },
    /// Already integrated; no effect
    Duplicate,
    /// Buffered until its dependencies arrive
    Deferred { pending: usize },
}

/// Where a state change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(PeerId),
    Seed,
    Resync,
}

/// Delivered to subscribers after every state change.
#[derive(Debug, Clone)]
pub struct ReplicaChange {
    pub origin: ChangeOrigin,
    pub content: Arc<RichText>,
}

impl ReplicaChange {
    pub fn html(&self) -> String {
        self.content.to_html()
    }
}

/// Handle returned by [`ReplicaStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(&ReplicaChange) + Send + Sync>;

struct PendingOp {
    op: Operation,
    since: Instant,
}

/// Convergent replica of one document.
pub struct ReplicaStore {
    doc: Doc,
    doc_id: String,
    local: PeerId,
    lamport: u64,
    config: ReplicaConfig,
    pending: Vec<PendingOp>,
    last_resync_request: Option<Instant>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl ReplicaStore {
    pub fn new(local: PeerId, config: ReplicaConfig) -> Self {
        let doc = new_doc(local.client_id());
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(TEXT_NAME);
        }
        Self {
            doc,
            doc_id: String::new(),
            local,
            lamport: 0,
            config,
            pending: Vec::new(),
            last_resync_request: None,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Bind to `doc_id` and seed with `seed_html` unless history exists.
    ///
    /// Returns whether seed content was written. The seed is written under
    /// [`seed_client_id`] of its canonical HTML, so peers seeding identical
    /// content produce identical items that dedupe on merge, while different
    /// seeds merge as concurrent inserts.
    pub fn initialize(&mut self, doc_id: &str, seed_html: &str) -> Result<bool, CollabError> {
        self.doc_id = doc_id.to_string();
        if self.has_history() {
            log::debug!("Replica for {doc_id} already has history; seed ignored");
            return Ok(false);
        }
        let rich = RichText::from_html(seed_html);
        if rich.is_empty() {
            return Ok(false);
        }
        self.apply_update_bytes(&seed_update(&rich))?;
        log::info!("Seeded replica for {doc_id} ({} chars)", rich.char_len());
        self.notify(ChangeOrigin::Seed);
        Ok(true)
    }

    /// Apply a persisted full replica state.
    pub fn restore(&mut self, state: &[u8]) -> Result<(), CollabError> {
        self.apply_state_update(state).map(|_| ())
    }

    /// Whether any causal history exists yet.
    pub fn has_history(&self) -> bool {
        let txn = self.doc.transact();
        let has = txn.state_vector().iter().next().is_some();
        has
    }

    /// Integrate a local edit. Indices past the end are clamped.
    pub fn apply_local_change(&mut self, edit: Edit) -> LocalChange {
        let deps = self.current_state_vector();
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_NAME);
            let plain = text.get_string(&txn);
            let char_len = plain.chars().count();
            let changed = match &edit {
                Edit::Insert { index, text: chunk, marks } => {
                    if chunk.is_empty() {
                        false
                    } else {
                        let at = byte_offset(&plain, (*index).min(char_len));
                        text.insert_with_attributes(&mut txn, at, chunk, marks_to_attrs(marks));
                        true
                    }
                }
                Edit::Delete { index, len } => match byte_range(&plain, *index, *len) {
                    Some((at, n)) => {
                        text.remove_range(&mut txn, at, n);
                        true
                    }
                    None => false,
                },
                Edit::Format {
                    index,
                    len,
                    mark,
                    enabled,
                } => match byte_range(&plain, *index, *len) {
                    Some((at, n)) => {
                        text.format(&mut txn, at, n, mark_attrs(mark, *enabled));
                        true
                    }
                    None => false,
                },
            };
            changed.then(|| txn.encode_update_v1())
        };

        let op = update.map(|update| {
            self.lamport += 1;
            Operation {
                origin: self.local,
                clock: self.lamport,
                deps: deps.encode_v1(),
                covers: self.current_state_vector().encode_v1(),
                update,
            }
        });
        if op.is_some() {
            self.notify(ChangeOrigin::Local);
        }
        LocalChange {
            op,
            content: self.materialize(),
        }
    }

    /// Integrate a peer's operation.
    ///
    /// Idempotent and order-insensitive. Returns `MergeDeferred` with
    /// `resync_required` when the op cannot be buffered because the
    /// pending buffer is full.
    pub fn apply_remote_change(&mut self, op: Operation) -> Result<MergeOutcome, CollabError> {
        let deps = decode_sv(&op.deps)?;
        let covers = decode_sv(&op.covers)?;
        let local = self.current_state_vector();

        if is_duplicate(&local, &deps, &covers) {
            log::trace!("Duplicate op {} from {}", op.clock, op.origin);
            return Ok(MergeOutcome::Duplicate);
        }

        if !dominates(&local, &deps) {
            if self.pending.len() >= self.config.max_pending {
                log::warn!(
                    "Pending buffer full ({}) for {}; op {} from {} needs resync",
                    self.pending.len(),
                    self.doc_id,
                    op.clock,
                    op.origin
                );
                return Err(CollabError::MergeDeferred {
                    pending: self.pending.len(),
                    resync_required: true,
                });
            }
            log::debug!("Deferring op {} from {} until dependencies arrive", op.clock, op.origin);
            self.pending.push(PendingOp {
                op,
                since: Instant::now(),
            });
            return Ok(MergeOutcome::Deferred {
                pending: self.pending.len(),
            });
        }

        let origin = op.origin;
        self.lamport = self.lamport.max(op.clock);
        self.apply_update_bytes(&op.update)?;
        let drained = self.drain_pending()?;
        self.notify(ChangeOrigin::Remote(origin));
        Ok(MergeOutcome::Applied { drained })
    }

    /// Apply a state diff (SyncStep2 or a persisted state).
    ///
    /// Returns how many buffered ops were drained afterwards.
    pub fn apply_state_update(&mut self, update: &[u8]) -> Result<usize, CollabError> {
        let before = self.rich_text();
        self.apply_update_bytes(update)?;
        let drained = self.drain_pending()?;
        self.last_resync_request = None;
        if self.rich_text() != before {
            self.notify(ChangeOrigin::Resync);
        }
        Ok(drained)
    }

    /// Current content as canonical HTML.
    pub fn materialize(&self) -> String {
        self.rich_text().to_html()
    }

    /// Current content as rich text runs.
    pub fn rich_text(&self) -> RichText {
        let txn = self.doc.transact();
        let mut rich = RichText::new();
        if let Some(text) = txn.get_text(TEXT_NAME) {
            for diff in text.diff(&txn, YChange::identity) {
                let marks = attrs_to_marks(diff.attributes.as_deref());
                rich.push(diff.insert.to_string(&txn), marks);
            }
        }
        rich
    }

    pub fn plain_text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Register a change callback.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&ReplicaChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    // ─── Sync handshake ───────────────────────────────────────────────

    /// Encoded state vector (SyncStep1 payload).
    pub fn state_vector(&self) -> Vec<u8> {
        self.current_state_vector().encode_v1()
    }

    /// Everything a peer with `remote_sv` is missing (SyncStep2 payload).
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = decode_sv(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encoded yrs snapshot: state vector plus delete set.
    ///
    /// Changes on every edit, including delete-only ones that leave the
    /// state vector untouched.
    pub fn version_marker(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.snapshot().encode_v1()
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Durable projection of the current state.
    pub fn snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            doc_id: self.doc_id.clone(),
            content: self.materialize(),
            version: self.version_marker(),
            state: self.encode_state(),
            saved_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    // ─── Causal buffer ────────────────────────────────────────────────

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether buffered ops have waited past the stall timeout and no
    /// resync was requested within that window.
    pub fn is_stalled(&self, now: Instant) -> bool {
        let timeout = self.config.stall_timeout();
        let oldest_stale = self
            .pending
            .iter()
            .map(|p| p.since)
            .min()
            .is_some_and(|since| now.saturating_duration_since(since) >= timeout);
        let recently_requested = self
            .last_resync_request
            .is_some_and(|at| now.saturating_duration_since(at) < timeout);
        oldest_stale && !recently_requested
    }

    /// Record that a full-state resync was requested at `now`.
    pub fn note_resync_requested(&mut self, now: Instant) {
        self.last_resync_request = Some(now);
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn peer(&self) -> PeerId {
        self.local
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn current_state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    fn apply_update_bytes(&mut self, bytes: &[u8]) -> Result<(), CollabError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| CollabError::Replica(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Replica(e.to_string()))
    }

    /// Apply every buffered op whose dependencies are now satisfied.
    fn drain_pending(&mut self) -> Result<usize, CollabError> {
        let mut drained = 0;
        loop {
            let local = self.current_state_vector();
            let mut ready = None;
            let mut stale = Vec::new();
            for (i, pending) in self.pending.iter().enumerate() {
                let deps = decode_sv(&pending.op.deps)?;
                let covers = decode_sv(&pending.op.covers)?;
                if is_duplicate(&local, &deps, &covers) {
                    stale.push(i);
                } else if ready.is_none() && dominates(&local, &deps) {
                    ready = Some(i);
                }
            }

            let next = ready.map(|i| self.pending[i].op.clone());
            let mut index = 0;
            self.pending.retain(|_| {
                let keep = !stale.contains(&index) && Some(index) != ready;
                index += 1;
                keep
            });

            match next {
                Some(op) => {
                    self.lamport = self.lamport.max(op.clock);
                    self.apply_update_bytes(&op.update)?;
                    drained += 1;
                }
                None => break,
            }
        }
        if drained > 0 {
            log::debug!("Drained {drained} buffered op(s) for {}", self.doc_id);
        }
        Ok(drained)
    }

    fn notify(&self, origin: ChangeOrigin) {
        if self.subscribers.is_empty() {
            return;
        }
        let change = ReplicaChange {
            origin,
            content: Arc::new(self.rich_text()),
        };
        for (_, callback) in &self.subscribers {
            callback(&change);
        }
    }
}

fn new_doc(client_id: u64) -> Doc {
    Doc::with_options(Options {
        client_id,
        offset_kind: OffsetKind::Bytes,
        ..Options::default()
    })
}

/// Deterministic update writing `rich` into an empty document.
fn seed_update(rich: &RichText) -> Vec<u8> {
    let doc = new_doc(seed_client_id(&rich.to_html()));
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text(TEXT_NAME);
    let mut at = 0u32;
    for span in rich.spans() {
        text.insert_with_attributes(&mut txn, at, &span.text, marks_to_attrs(&span.marks));
        at += span.text.len() as u32;
    }
    txn.encode_update_v1()
}

fn decode_sv(bytes: &[u8]) -> Result<StateVector, CollabError> {
    StateVector::decode_v1(bytes).map_err(|e| CollabError::Replica(e.to_string()))
}

/// `a` has seen everything `b` has.
fn dominates(a: &StateVector, b: &StateVector) -> bool {
    b.iter().all(|(client, clock)| a.get(client) >= *clock)
}

/// The op introduced items and all of them are already integrated.
fn is_duplicate(local: &StateVector, deps: &StateVector, covers: &StateVector) -> bool {
    !dominates(deps, covers) && dominates(local, covers)
}

fn byte_offset(s: &str, char_index: usize) -> u32 {
    s.char_indices()
        .nth(char_index)
        .map_or(s.len(), |(b, _)| b) as u32
}

/// Clamped `[index, index + len)` in bytes, or None when empty.
fn byte_range(s: &str, index: usize, len: usize) -> Option<(u32, u32)> {
    let char_len = s.chars().count();
    let from = index.min(char_len);
    let to = index.saturating_add(len).min(char_len);
    if from >= to {
        return None;
    }
    let start = byte_offset(s, from);
    Some((start, byte_offset(s, to) - start))
}

const ATTR_BOLD: &str = "bold";
const ATTR_ITALIC: &str = "italic";
const ATTR_UNDERLINE: &str = "underline";
const ATTR_STRIKE: &str = "strike";
const ATTR_CODE: &str = "code";
const ATTR_LINK: &str = "link";

fn mark_key(mark: &Mark) -> &'static str {
    match mark {
        Mark::Bold => ATTR_BOLD,
        Mark::Italic => ATTR_ITALIC,
        Mark::Underline => ATTR_UNDERLINE,
        Mark::Strike => ATTR_STRIKE,
        Mark::Code => ATTR_CODE,
        Mark::Link(_) => ATTR_LINK,
    }
}

fn mark_value(mark: &Mark) -> Any {
    match mark {
        Mark::Link(href) => Any::String(href.as_str().into()),
        _ => Any::Bool(true),
    }
}

/// Explicit attributes for an insert. Absent keys clear inherited marks.
fn marks_to_attrs(marks: &Marks) -> Attrs {
    let mut attrs = Attrs::new();
    let flags = [
        (marks.bold, ATTR_BOLD),
        (marks.italic, ATTR_ITALIC),
        (marks.underline, ATTR_UNDERLINE),
        (marks.strike, ATTR_STRIKE),
        (marks.code, ATTR_CODE),
    ];
    for (_, key) in flags.iter().filter(|(on, _)| *on) {
        attrs.insert(Arc::from(*key), Any::Bool(true));
    }
    if let Some(href) = &marks.link {
        attrs.insert(Arc::from(ATTR_LINK), Any::String(href.as_str().into()));
    }
    attrs
}

fn mark_attrs(mark: &Mark, enabled: bool) -> Attrs {
    let mut attrs = Attrs::new();
    let value = if enabled { mark_value(mark) } else { Any::Null };
    attrs.insert(Arc::from(mark_key(mark)), value);
    attrs
}

fn attrs_to_marks(attrs: Option<&Attrs>) -> Marks {
    let Some(attrs) = attrs else {
        return Marks::plain();
    };
    let flag = |key: &str| matches!(attrs.get(key), Some(Any::Bool(true)));
    Marks {
        bold: flag(ATTR_BOLD),
        italic: flag(ATTR_ITALIC),
        underline: flag(ATTR_UNDERLINE),
        strike: flag(ATTR_STRIKE),
        code: flag(ATTR_CODE),
        link: match attrs.get(ATTR_LINK) {
            Some(Any::String(href)) => Some(href.to_string()),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    fn replica(n: u128) -> ReplicaStore {
        ReplicaStore::new(peer(n), ReplicaConfig::default())
    }

    fn op(change: LocalChange) -> Operation {
        change.op.expect("edit should produce an op")
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for pos in 0..=rest.len() {
                let mut p = rest.clone();
                p.insert(pos, n - 1);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_seed_roundtrip() {
        let seed = "<p>Intro <strong>bold</strong> and <a href=\"https://x.io\">link</a></p><p>Second</p>";
        let mut r = replica(1);
        assert!(r.initialize("post-1", seed).unwrap());
        assert_eq!(r.materialize(), seed);
        assert_eq!(r.doc_id(), "post-1");
    }

    #[test]
    fn test_reseed_is_noop() {
        let mut r = replica(1);
        r.initialize("doc", "<p>abc</p>").unwrap();
        r.apply_local_change(Edit::insert(3, "d"));

        assert!(!r.initialize("doc", "<p>abc</p>").unwrap());
        assert_eq!(r.plain_text(), "abcd");
    }

    #[test]
    fn test_empty_seed_leaves_no_history() {
        let mut r = replica(1);
        assert!(!r.initialize("doc", "").unwrap());
        assert!(!r.has_history());
        assert_eq!(r.materialize(), "");
    }

    #[test]
    fn test_independent_seeds_do_not_duplicate() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "<p>shared</p>").unwrap();
        b.initialize("doc", "<p>shared</p>").unwrap();

        a.apply_state_update(&b.encode_state()).unwrap();
        b.apply_state_update(&a.encode_state()).unwrap();

        assert_eq!(a.plain_text(), "shared");
        assert_eq!(b.plain_text(), "shared");
    }

    #[test]
    fn test_different_seeds_converge() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "<p>abc</p>").unwrap();
        b.initialize("doc", "<p>xyz</p>").unwrap();

        let from_a = a.encode_state();
        let from_b = b.encode_state();
        a.apply_state_update(&from_b).unwrap();
        b.apply_state_update(&from_a).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        let text = a.plain_text();
        assert!(text.contains("abc") && text.contains("xyz"), "{text}");
        assert_eq!(text.chars().count(), 6);
    }

    #[test]
    fn test_local_edits() {
        let mut r = replica(1);
        r.initialize("doc", "<p>hello world</p>").unwrap();

        let change = r.apply_local_change(Edit::format(0, 5, Mark::Bold, true));
        assert_eq!(change.content, "<p><strong>hello</strong> world</p>");

        let change = r.apply_local_change(Edit::delete(5, 6));
        assert_eq!(change.content, "<p><strong>hello</strong></p>");

        let change = r.apply_local_change(Edit::Insert {
            index: 5,
            text: "!".into(),
            marks: Marks::plain().with(Mark::Italic),
        });
        assert_eq!(change.content, "<p><strong>hello</strong><em>!</em></p>");

        let change = r.apply_local_change(Edit::format(0, 5, Mark::Bold, false));
        assert_eq!(change.content, "<p>hello<em>!</em></p>");
    }

    #[test]
    fn test_local_edit_clamps_and_skips_noops() {
        let mut r = replica(1);
        r.initialize("doc", "<p>ab</p>").unwrap();

        let change = r.apply_local_change(Edit::insert(99, "c"));
        assert!(change.op.is_some());
        assert_eq!(r.plain_text(), "abc");

        assert!(r.apply_local_change(Edit::delete(10, 4)).op.is_none());
        assert!(r.apply_local_change(Edit::insert(0, "")).op.is_none());
        assert_eq!(r.plain_text(), "abc");
    }

    #[test]
    fn test_multibyte_positions() {
        let mut r = replica(1);
        r.initialize("doc", "<p>héllo</p>").unwrap();
        r.apply_local_change(Edit::insert(2, "✓"));
        r.apply_local_change(Edit::delete(0, 1));
        assert_eq!(r.plain_text(), "é✓llo");
    }

    #[test]
    fn test_concurrent_inserts_tie_break_by_client_id() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "").unwrap();
        b.initialize("doc", "").unwrap();

        let op_a = op(a.apply_local_change(Edit::insert(0, "Hello")));
        let op_b = op(b.apply_local_change(Edit::insert(0, "World")));

        a.apply_remote_change(op_b).unwrap();
        b.apply_remote_change(op_a).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.plain_text(), "HelloWorld");
    }

    #[test]
    fn test_convergence_under_all_permutations() {
        let seed = "<p>abc</p>";
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", seed).unwrap();
        b.initialize("doc", seed).unwrap();

        let a1 = op(a.apply_local_change(Edit::insert(1, "X")));
        let a2 = op(a.apply_local_change(Edit::format(0, 2, Mark::Bold, true)));
        let b1 = op(b.apply_local_change(Edit::delete(2, 1)));
        let b2 = op(b.apply_local_change(Edit::insert(0, "Y")));
        let ops = [a1, a2, b1, b2];

        let mut reference: Option<String> = None;
        for order in permutations(ops.len()) {
            let mut c = replica(3);
            c.initialize("doc", seed).unwrap();
            for &i in &order {
                c.apply_remote_change(ops[i].clone()).unwrap();
            }
            assert_eq!(c.pending_len(), 0, "order {order:?} left ops buffered");
            let content = c.materialize();
            match &reference {
                Some(expected) => assert_eq!(&content, expected, "order {order:?}"),
                None => reference = Some(content),
            }
        }

        a.apply_remote_change(ops[2].clone()).unwrap();
        a.apply_remote_change(ops[3].clone()).unwrap();
        b.apply_remote_change(ops[0].clone()).unwrap();
        b.apply_remote_change(ops[1].clone()).unwrap();
        assert_eq!(Some(a.materialize()), reference);
        assert_eq!(Some(b.materialize()), reference);
    }

    #[test]
    fn test_remote_apply_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "<p>x</p>").unwrap();
        b.initialize("doc", "<p>x</p>").unwrap();

        let insert = op(a.apply_local_change(Edit::insert(1, "yz")));
        assert_eq!(
            b.apply_remote_change(insert.clone()).unwrap(),
            MergeOutcome::Applied { drained: 0 }
        );
        let once = b.materialize();
        assert_eq!(b.apply_remote_change(insert).unwrap(), MergeOutcome::Duplicate);
        assert_eq!(b.materialize(), once);

        // Delete-only ops carry no new items; reapplying them is still harmless
        let delete = op(a.apply_local_change(Edit::delete(0, 1)));
        b.apply_remote_change(delete.clone()).unwrap();
        b.apply_remote_change(delete).unwrap();
        assert_eq!(b.plain_text(), "yz");
    }

    #[test]
    fn test_out_of_order_ops_are_buffered_then_drained() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "").unwrap();
        b.initialize("doc", "").unwrap();

        let first = op(a.apply_local_change(Edit::insert(0, "ab")));
        let second = op(a.apply_local_change(Edit::insert(2, "cd")));

        assert_eq!(
            b.apply_remote_change(second).unwrap(),
            MergeOutcome::Deferred { pending: 1 }
        );
        assert_eq!(b.plain_text(), "");

        assert_eq!(
            b.apply_remote_change(first).unwrap(),
            MergeOutcome::Applied { drained: 1 }
        );
        assert_eq!(b.plain_text(), "abcd");
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.lamport(), 2);
    }

    #[test]
    fn test_buffer_overflow_requires_resync() {
        let mut a = replica(1);
        let mut b = ReplicaStore::new(
            peer(2),
            ReplicaConfig {
                max_pending: 1,
                ..ReplicaConfig::default()
            },
        );
        a.initialize("doc", "").unwrap();
        b.initialize("doc", "").unwrap();

        let _lost = op(a.apply_local_change(Edit::insert(0, "a")));
        let second = op(a.apply_local_change(Edit::insert(1, "b")));
        let third = op(a.apply_local_change(Edit::insert(2, "c")));

        b.apply_remote_change(second).unwrap();
        let err = b.apply_remote_change(third).unwrap_err();
        assert!(matches!(
            err,
            CollabError::MergeDeferred {
                resync_required: true,
                ..
            }
        ));

        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.apply_state_update(&diff).unwrap();
        assert_eq!(b.plain_text(), "abc");
        assert_eq!(b.pending_len(), 0, "covered pending ops are discarded");
    }

    #[test]
    fn test_stall_detection() {
        let mut a = replica(1);
        let mut b = ReplicaStore::new(
            peer(2),
            ReplicaConfig {
                max_pending: 8,
                stall_timeout_ms: 500,
            },
        );
        a.initialize("doc", "").unwrap();
        b.initialize("doc", "").unwrap();
        let _missing = a.apply_local_change(Edit::insert(0, "a"));
        let later = op(a.apply_local_change(Edit::insert(1, "b")));

        let now = Instant::now();
        assert!(!b.is_stalled(now));
        b.apply_remote_change(later).unwrap();

        let stalled_at = Instant::now() + Duration::from_millis(600);
        assert!(b.is_stalled(stalled_at));
        b.note_resync_requested(stalled_at);
        assert!(!b.is_stalled(stalled_at + Duration::from_millis(100)));
        assert!(b.is_stalled(stalled_at + Duration::from_millis(500)));
    }

    #[test]
    fn test_subscribers_see_every_change() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.initialize("doc", "").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let remote = Arc::new(AtomicUsize::new(0));
        let seen_c = seen.clone();
        let remote_c = remote.clone();
        let first = b.subscribe(move |_| {
            seen_c.fetch_add(1, Ordering::SeqCst);
        });
        b.subscribe(move |change| {
            if matches!(change.origin, ChangeOrigin::Remote(_)) {
                remote_c.fetch_add(1, Ordering::SeqCst);
            }
        });

        b.initialize("doc", "<p>hi</p>").unwrap();
        b.apply_local_change(Edit::insert(0, ">"));
        let remote_op = op(a.apply_local_change(Edit::insert(0, "x")));
        b.apply_remote_change(remote_op).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(remote.load(Ordering::SeqCst), 1);

        assert!(b.unsubscribe(first));
        assert!(!b.unsubscribe(first));
        b.apply_local_change(Edit::insert(0, ">"));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_snapshot_restores_history() {
        let mut a = replica(1);
        a.initialize("doc", "<p>draft</p>").unwrap();
        a.apply_local_change(Edit::insert(5, " two"));
        let snapshot = a.snapshot();
        assert_eq!(snapshot.content, "<p>draft two</p>");

        let mut b = replica(2);
        b.restore(&snapshot.state).unwrap();
        assert!(!b.initialize("doc", &snapshot.content).unwrap());
        assert_eq!(b.materialize(), snapshot.content);
        assert_eq!(b.version_marker(), snapshot.version);
    }

    #[test]
    fn test_delete_only_edit_moves_version() {
        let mut r = replica(1);
        r.initialize("doc", "<p>abc</p>").unwrap();
        let before = r.snapshot();
        let sv = r.state_vector();
        r.apply_local_change(Edit::delete(0, 3));
        let after = r.snapshot();
        // Deletes leave the state vector as is
        assert_eq!(r.state_vector(), sv);
        assert_ne!(before.version, after.version);
        assert_eq!(after.content, "");
    }

    #[test]
    fn test_malformed_op_is_rejected() {
        let mut r = replica(1);
        let bogus = Operation {
            origin: peer(9),
            clock: 1,
            deps: vec![0xff, 0xff],
            covers: vec![],
            update: vec![],
        };
        assert!(matches!(
            r.apply_remote_change(bogus),
            Err(CollabError::Replica(_))
        ));
    }

    #[test]
    fn test_broken_update_is_an_error_not_a_noop() {
        let mut author = replica(1);
        let mut good = author.apply_local_change(Edit::insert(0, "hello")).op.unwrap();
        good.update.truncate(good.update.len() / 2);

        let mut r = replica(2);
        assert!(matches!(
            r.apply_remote_change(good),
            Err(CollabError::Replica(_))
        ));
        assert_eq!(r.plain_text(), "");
        assert!(matches!(
            r.apply_state_update(&[0x01, 0x05]),
            Err(CollabError::Replica(_))
        ));
    }
}
