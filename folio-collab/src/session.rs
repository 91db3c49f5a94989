//! One open document: replica, transport, presence, surface and saves.
//!
//! ```text
//!            ┌────────────── EditorSession::next_event ───────────────┐
//! transport ─┤ Operation / SyncStep1 / SyncStep2 / Awareness / Join   │
//! ticker ────┤ heartbeat, evict_stale, stall resync, periodic save    ├─► SessionEvent
//! saves ─────┤ SaveReport                                             │
//!            └─────────────────────────────────────────────────────────┘
//! host ──► handle_input ──► SurfaceAdapter ──► ReplicaStore ──► broadcast
//! ```
//!
//! Every replica mutation happens on the caller of `next_event` or
//! `handle_input`. The host drives the loop; nothing here spawns except
//! the transport supervisor and background saves.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::awareness::{
    ActiveUser, AwarenessTracker, AwarenessUpdate, ColorPolicy, PresenceChange, PresenceState,
    UserIdentity,
};
use crate::config::CollabConfig;
use crate::error::{CollabError, PersistenceError};
use crate::markup::RichText;
use crate::persistence::{PersistenceBridge, SaveReport, SnapshotStore};
use crate::protocol::{MessageType, PeerId, SyncMessage};
use crate::replica::{ChangeOrigin, MergeOutcome, Operation, ReplicaStore};
use crate::share::ShareLink;
use crate::surface::{EditorView, InputEvent, SurfaceAdapter};
use crate::transport::{ConnectionState, Transport, TransportEvent};

const MIN_TICK: Duration = Duration::from_millis(10);

/// What the host supplies when opening a document.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub document_id: String,
    /// Shared secret scoping the room; carried in share links
    pub room_secret: String,
    /// Seed HTML, used only when no history exists
    pub initial_content: String,
    pub user: UserIdentity,
    pub read_only: bool,
}

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The view was patched with non-local changes
    ContentChanged { origin: ChangeOrigin, html: String },
    ConnectionChanged(ConnectionState),
    ConnectionError(String),
    RetriesExhausted,
    Presence(PresenceChange),
    /// A full-state resync was requested from the room
    ResyncRequested { pending: usize },
    Saved { attempts: u32 },
    /// Persistence failed; editing continues
    SaveWarning(PersistenceError),
}

/// An open collaborative document.
pub struct EditorSession<T: Transport, S: SnapshotStore, V: EditorView> {
    params: SessionParams,
    config: CollabConfig,
    replica: ReplicaStore,
    awareness: AwarenessTracker,
    surface: SurfaceAdapter<V>,
    persistence: PersistenceBridge<S>,
    transport: T,
    transport_events: mpsc::Receiver<TransportEvent>,
    ticker: Interval,
    last_heartbeat: Instant,
    pending_events: VecDeque<SessionEvent>,
    transport_closed: bool,
}

impl<T: Transport, S: SnapshotStore, V: EditorView> EditorSession<T, S, V> {
    /// Load, seed, connect and mount.
    ///
    /// Load and connect failures are not fatal: the session starts from the
    /// seed and the transport keeps retrying. A failed mount disconnects the
    /// transport and returns the error.
    pub async fn open(
        params: SessionParams,
        mut transport: T,
        store: S,
        view: V,
        config: CollabConfig,
    ) -> Result<Self, CollabError> {
        config.validate()?;
        let doc_id = params.document_id.clone();
        let local = transport.peer_id();
        let mut pending_events = VecDeque::new();

        let transport_events = transport
            .take_event_rx()
            .ok_or_else(|| CollabError::Connection("transport events already taken".into()))?;

        let mut persistence = PersistenceBridge::new(store, config.persistence.clone());
        let mut replica = ReplicaStore::new(local, config.replica.clone());
        match persistence.load(&doc_id).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = replica.restore(&snapshot.state) {
                    log::warn!("Snapshot for {doc_id} could not be restored: {e}");
                    pending_events
                        .push_back(SessionEvent::SaveWarning(PersistenceError::Corrupt(e.to_string())));
                } else {
                    log::info!("Restored {doc_id} from snapshot saved at {}", snapshot.saved_at);
                }
            }
            Ok(None) => log::debug!("No snapshot for {doc_id}"),
            Err(e) => {
                log::warn!("Loading {doc_id} failed, starting from seed: {e}");
                pending_events.push_back(SessionEvent::SaveWarning(e));
            }
        }
        replica.initialize(&doc_id, &params.initial_content)?;

        let mut colors = ColorPolicy::for_identity(config.awareness.palette.clone(), &params.user);
        let presence = PresenceState::for_identity(&params.user, colors.pick());
        let awareness = AwarenessTracker::new(local, presence, &config.awareness);

        if let Err(e) = transport.connect(&doc_id, &params.room_secret).await {
            log::warn!("Initial connect for {doc_id} failed, retrying in background: {e}");
        }

        let surface = match SurfaceAdapter::mount(view, replica.rich_text(), params.read_only) {
            Ok(surface) => surface,
            Err(e) => {
                log::warn!("Mount failed for {doc_id}: {e}");
                transport.disconnect().await;
                return Err(e);
            }
        };

        let mut ticker = tokio::time::interval(tick_period(&config));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Opened session for {doc_id} as {local}");
        Ok(Self {
            params,
            config,
            replica,
            awareness,
            surface,
            persistence,
            transport,
            transport_events,
            ticker,
            last_heartbeat: Instant::now(),
            pending_events,
            transport_closed: false,
        })
    }

    /// Drive the session until something worth reporting happens.
    ///
    /// Returns `None` once the transport has shut down for good.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending_events.pop_front() {
                return Some(event);
            }
            if self.transport_closed {
                return None;
            }
            tokio::select! {
                event = self.transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => self.transport_closed = true,
                },
                _ = self.ticker.tick() => self.on_tick(Instant::now()),
                Some(report) = self.persistence.next_report() => self.on_save_report(report),
            }
        }
    }

    /// Apply host input and broadcast the resulting operations.
    ///
    /// Returns whether the content changed.
    pub fn handle_input(&mut self, event: InputEvent) -> Result<bool, CollabError> {
        let outcome = self.surface.handle_input(&mut self.replica, event)?;
        for op in &outcome.ops {
            self.persistence.note_edit();
            let msg = SyncMessage::operation(&self.params.document_id, op)?;
            if let Err(e) = self.transport.broadcast(msg) {
                // The next handshake carries it instead
                log::warn!("Operation {} not queued: {e}", op.clock);
                self.pending_events
                    .push_back(SessionEvent::ConnectionError(e.to_string()));
            }
        }
        if let Some(selection) = outcome.selection {
            if self.awareness.local_state().cursor != Some(selection) {
                let update = self.awareness.set_local_cursor(Some(selection));
                self.send_awareness(update);
            }
        }
        Ok(outcome.content_changed)
    }

    /// Save immediately and wait. `Ok(false)` when nothing changed since
    /// the last save.
    pub async fn save_now(&mut self) -> Result<bool, PersistenceError> {
        self.persistence.save_and_wait(self.replica.snapshot()).await
    }

    pub fn share_link(&self) -> ShareLink {
        ShareLink::new(
            self.config.share.base_url.clone(),
            self.params.document_id.clone(),
            self.params.room_secret.clone(),
        )
    }

    /// Link inviting others into this room.
    pub fn share_url(&self) -> Result<String, CollabError> {
        self.share_link().to_url()
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.awareness.active_users()
    }

    /// Materialized content as canonical HTML.
    pub fn content(&self) -> String {
        self.replica.materialize()
    }

    pub fn rich_text(&self) -> RichText {
        self.replica.rich_text()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.params.read_only = read_only;
        self.surface.set_read_only(read_only);
    }

    pub fn is_read_only(&self) -> bool {
        self.params.read_only
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn document_id(&self) -> &str {
        &self.params.document_id
    }

    pub fn local_peer(&self) -> PeerId {
        self.replica.peer()
    }

    pub fn replica(&self) -> &ReplicaStore {
        &self.replica
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut AwarenessTracker {
        &mut self.awareness
    }

    pub fn surface(&self) -> &SurfaceAdapter<V> {
        &self.surface
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Announce leave, flush a final save, disconnect and unmount.
    ///
    /// Teardown always completes; a failed save is returned afterwards.
    pub async fn close(mut self) -> Result<(), CollabError> {
        let leave = self.awareness.leave_update();
        self.send_awareness(leave);

        let saved = self.persistence.save_and_wait(self.replica.snapshot()).await;
        self.transport.disconnect().await;
        self.surface.view_mut().unmount();
        log::info!("Closed session for {}", self.params.document_id);

        match saved {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Final save of {} failed: {e}", self.params.document_id);
                Err(e.into())
            }
        }
    }

    // ─── Event handling ───────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                if state == ConnectionState::Connected {
                    self.send_sync_step1(None);
                    let update = self.awareness.heartbeat();
                    self.last_heartbeat = Instant::now();
                    self.send_awareness(update);
                }
                self.pending_events
                    .push_back(SessionEvent::ConnectionChanged(state));
            }
            TransportEvent::ConnectionError(reason) => {
                self.pending_events
                    .push_back(SessionEvent::ConnectionError(reason));
            }
            TransportEvent::RetriesExhausted => {
                self.pending_events.push_back(SessionEvent::RetriesExhausted);
            }
            TransportEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn on_message(&mut self, msg: SyncMessage) {
        if msg.doc_id != self.params.document_id
            && !matches!(msg.msg_type, MessageType::Ping | MessageType::Pong)
        {
            log::debug!("Ignoring message for {} in {}", msg.doc_id, self.params.document_id);
            return;
        }
        let from = msg.peer_id;
        match msg.msg_type {
            MessageType::Operation => match msg.as_operation() {
                Ok(op) => self.on_operation(op),
                Err(e) => log::warn!("Malformed operation from {from}: {e}"),
            },
            MessageType::SyncStep1 => match self.replica.diff_since(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(self.local_peer(), &self.params.document_id, diff)
                        .to_peer(from);
                    self.send(reply);
                }
                Err(e) => log::warn!("Bad state vector from {from}: {e}"),
            },
            MessageType::SyncStep2 => match self.replica.apply_state_update(&msg.payload) {
                Ok(drained) => {
                    log::debug!("Applied state from {from} ({drained} buffered op(s) drained)");
                    self.refresh_view(ChangeOrigin::Resync);
                }
                Err(e) => log::warn!("Rejected state update from {from}: {e}"),
            },
            MessageType::Awareness => match AwarenessUpdate::decode(&msg.payload) {
                Ok(update) => {
                    if let Some(change) = self.awareness.apply_remote(update, Instant::now()) {
                        self.pending_events.push_back(SessionEvent::Presence(change));
                    }
                }
                Err(e) => log::warn!("Malformed awareness update from {from}: {e}"),
            },
            MessageType::PeerJoined => {
                match msg.join_request() {
                    Ok(join) => log::info!("{} ({from}) joined", join.info.name),
                    Err(e) => log::debug!("Join from {from} without payload: {e}"),
                }
                // Pull whatever the newcomer edited offline; let it see us
                self.send_sync_step1(Some(from));
                let update = self.awareness.local_update();
                self.send_awareness(update);
            }
            MessageType::PeerLeft => {
                if self.awareness.remove_peer(from) {
                    self.pending_events
                        .push_back(SessionEvent::Presence(PresenceChange::Removed(from)));
                }
            }
            MessageType::Ping | MessageType::Pong => {}
        }
    }

    fn on_operation(&mut self, op: Operation) {
        let origin = op.origin;
        match self.replica.apply_remote_change(op) {
            Ok(MergeOutcome::Applied { drained }) => {
                log::trace!("Applied op from {origin} ({drained} drained)");
                self.refresh_view(ChangeOrigin::Remote(origin));
            }
            Ok(MergeOutcome::Duplicate) => {}
            Ok(MergeOutcome::Deferred { pending }) => {
                log::debug!("Op from {origin} deferred ({pending} pending)");
            }
            Err(CollabError::MergeDeferred { pending, .. }) => {
                log::warn!("Causal buffer overflow ({pending} pending); requesting resync");
                self.request_resync(Instant::now());
            }
            Err(e) => log::warn!("Rejected op from {origin}: {e}"),
        }
    }

    fn on_tick(&mut self, now: Instant) {
        for peer in self.awareness.evict_stale(now) {
            self.pending_events
                .push_back(SessionEvent::Presence(PresenceChange::Removed(peer)));
        }

        if self.replica.is_stalled(now) {
            log::warn!(
                "{} op(s) stalled past {} ms; requesting resync",
                self.replica.pending_len(),
                self.config.replica.stall_timeout_ms
            );
            self.request_resync(now);
        }

        if now.saturating_duration_since(self.last_heartbeat) >= self.config.awareness.heartbeat_interval() {
            self.last_heartbeat = now;
            let update = self.awareness.heartbeat();
            self.send_awareness(update);
        }

        if self.persistence.should_save(now) {
            self.persistence.begin_save(self.replica.snapshot());
        }
    }

    fn on_save_report(&mut self, report: SaveReport) {
        let event = match report.result {
            Ok(attempts) => SessionEvent::Saved { attempts },
            Err(e) => SessionEvent::SaveWarning(e),
        };
        self.pending_events.push_back(event);
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn request_resync(&mut self, now: Instant) {
        self.replica.note_resync_requested(now);
        self.send_sync_step1(None);
        self.pending_events.push_back(SessionEvent::ResyncRequested {
            pending: self.replica.pending_len(),
        });
    }

    fn send_sync_step1(&self, target: Option<PeerId>) {
        let mut msg = SyncMessage::sync_step1(
            self.local_peer(),
            &self.params.document_id,
            self.replica.state_vector(),
        );
        if let Some(peer) = target {
            msg = msg.to_peer(peer);
        }
        self.send(msg);
    }

    fn send_awareness(&self, update: AwarenessUpdate) {
        match update.encode() {
            Ok(bytes) => {
                let msg = SyncMessage::awareness(
                    self.local_peer(),
                    &self.params.document_id,
                    update.clock(),
                    bytes,
                );
                self.send(msg);
            }
            Err(e) => log::warn!("Could not encode awareness update: {e}"),
        }
    }

    fn send(&self, msg: SyncMessage) {
        if let Err(e) = self.transport.broadcast(msg) {
            log::debug!("Dropped outbound message: {e}");
        }
    }

    fn refresh_view(&mut self, origin: ChangeOrigin) {
        if self.surface.apply_remote(&self.replica.rich_text()).is_some() {
            self.pending_events.push_back(SessionEvent::ContentChanged {
                origin,
                html: self.replica.materialize(),
            });
        }
    }
}

fn tick_period(config: &CollabConfig) -> Duration {
    config
        .awareness
        .heartbeat_interval()
        .min(config.replica.stall_timeout())
        .min(config.persistence.save_interval())
        .max(MIN_TICK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemorySnapshotStore;
    use crate::protocol::PeerInfo;
    use crate::surface::BufferView;
    use crate::transport::{LocalRelay, MemoryTransport};
    use uuid::Uuid;

    type TestSession = EditorSession<MemoryTransport, MemorySnapshotStore, BufferView>;

    fn params(name: &str) -> SessionParams {
        SessionParams {
            document_id: "post-1".into(),
            room_secret: "s3cret".into(),
            initial_content: String::new(),
            user: UserIdentity::new(name),
            read_only: false,
        }
    }

    async fn open(relay: &LocalRelay, n: u128, store: MemorySnapshotStore, params: SessionParams) -> TestSession {
        let config = CollabConfig::for_testing();
        let peer = PeerInfo::with_id(PeerId::from_uuid(Uuid::from_u128(n)), params.user.name.clone());
        let transport = relay.transport(peer, config.transport.clone());
        EditorSession::open(params, transport, store, BufferView::default(), config)
            .await
            .unwrap()
    }

    /// Pump the session until `done` holds or time runs out.
    async fn pump_until<F>(session: &mut TestSession, mut done: F)
    where
        F: FnMut(&TestSession) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !done(session) {
                if session.next_event().await.is_none() {
                    break;
                }
            }
        })
        .await
        .expect("condition not reached within timeout");
    }

    async fn pump_for(session: &mut TestSession, window: Duration) {
        let _ = tokio::time::timeout(window, async {
            while session.next_event().await.is_some() {}
        })
        .await;
    }

    #[tokio::test]
    async fn test_open_seeds_and_mounts() {
        let relay = LocalRelay::default();
        let mut p = params("Ada");
        p.initial_content = "<p>Draft</p>".into();
        let session = open(&relay, 1, MemorySnapshotStore::new(), p).await;

        assert_eq!(session.content(), "<p>Draft</p>");
        assert!(session.surface().view().mounted);
        assert_eq!(session.surface().get_serialized_content(), "<p>Draft</p>");
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_wins_over_seed() {
        let relay = LocalRelay::default();
        let store = MemorySnapshotStore::new();
        let mut first = open(&relay, 1, store.clone(), params("Ada")).await;
        first.handle_input(InputEvent::Insert { at: 0, text: "Saved".into() }).unwrap();
        first.close().await.unwrap();
        assert_eq!(store.get("post-1").unwrap().content, "<p>Saved</p>");

        let mut p = params("Ada");
        p.initial_content = "<p>Seed</p>".into();
        let second = open(&relay, 1, store, p).await;
        assert_eq!(second.content(), "<p>Saved</p>");
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_mount_tears_down_transport() {
        let relay = LocalRelay::default();
        let config = CollabConfig::for_testing();
        let transport = relay.transport(PeerInfo::new("Ada"), config.transport.clone());
        let view = BufferView {
            fail_mount: true,
            ..BufferView::default()
        };
        let result = EditorSession::open(params("Ada"), transport, MemorySnapshotStore::new(), view, config).await;
        assert!(matches!(result, Err(CollabError::View(_))));

        let token = crate::protocol::room_token("post-1", "s3cret");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.peer_count(&token), 0);
    }

    #[tokio::test]
    async fn test_two_sessions_converge() {
        let relay = LocalRelay::default();
        let mut a = open(&relay, 1, MemorySnapshotStore::new(), params("Ada")).await;
        let mut b = open(&relay, 2, MemorySnapshotStore::new(), params("Bo")).await;

        a.handle_input(InputEvent::Insert { at: 0, text: "Hello".into() }).unwrap();
        b.handle_input(InputEvent::Insert { at: 0, text: "World".into() }).unwrap();

        tokio::join!(
            pump_for(&mut a, Duration::from_millis(300)),
            pump_for(&mut b, Duration::from_millis(300)),
        );
        assert_eq!(a.content(), b.content());
        assert_eq!(a.replica().plain_text(), "HelloWorld");
        assert_eq!(b.surface().view().content.plain_text(), "HelloWorld");

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_presence_is_shared() {
        let relay = LocalRelay::default();
        let mut a = open(&relay, 1, MemorySnapshotStore::new(), params("Ada")).await;
        let mut b = open(&relay, 2, MemorySnapshotStore::new(), params("Bo")).await;

        tokio::join!(
            pump_for(&mut a, Duration::from_millis(200)),
            pump_for(&mut b, Duration::from_millis(200)),
        );
        assert_eq!(a.active_users().len(), 2);
        let users = a.active_users();
        assert!(users[0].is_local);
        assert_eq!(users[1].name, "Bo");

        b.close().await.unwrap();
        pump_until(&mut a, |s| s.active_users().len() == 1).await;
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_only_session_rejects_input() {
        let relay = LocalRelay::default();
        let mut p = params("Ada");
        p.read_only = true;
        let mut session = open(&relay, 1, MemorySnapshotStore::new(), p).await;

        let err = session
            .handle_input(InputEvent::Insert { at: 0, text: "x".into() })
            .unwrap_err();
        assert!(matches!(err, CollabError::ReadOnly));
        assert!(!session.surface().view().editable);

        session.set_read_only(false);
        assert!(session.handle_input(InputEvent::Insert { at: 0, text: "x".into() }).unwrap());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_save_and_warning() {
        let relay = LocalRelay::default();
        let store = MemorySnapshotStore::new();
        let mut session = open(&relay, 1, store.clone(), params("Ada")).await;

        session.handle_input(InputEvent::Insert { at: 0, text: "a".into() }).unwrap();
        let saved = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::Saved { .. }) = session.next_event().await {
                    return true;
                }
            }
        })
        .await
        .unwrap();
        assert!(saved);
        assert_eq!(store.get("post-1").unwrap().content, "<p>a</p>");

        store.fail_next(100);
        session.handle_input(InputEvent::Insert { at: 1, text: "b".into() }).unwrap();
        let warned = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(SessionEvent::SaveWarning(_)) = session.next_event().await {
                    return true;
                }
            }
        })
        .await
        .unwrap();
        assert!(warned);
        // Editing is unaffected
        assert_eq!(session.content(), "<p>ab</p>");

        store.fail_next(0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_url_roundtrips() {
        let relay = LocalRelay::default();
        let session = open(&relay, 1, MemorySnapshotStore::new(), params("Ada")).await;
        let link = ShareLink::parse(&session.share_url().unwrap()).unwrap();
        assert_eq!(link.document_id, "post-1");
        assert_eq!(link.room_secret, "s3cret");
        session.close().await.unwrap();
    }
}
