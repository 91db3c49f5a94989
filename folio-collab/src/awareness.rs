//! Presence tracking for collaborators in a document room.
//!
//! ```text
//! set_local_state / set_local_cursor / heartbeat
//!       │  AwarenessUpdate::State { clock += 1 }
//!       ▼   (SyncMessage::Awareness broadcast)
//! Remote AwarenessTracker::apply_remote()
//!       │  newer clock wins, stale updates ignored
//!       ▼
//! on_change handlers ── Added / Updated / Removed
//!       ▲
//! evict_stale(now) ── peers silent past the liveness timeout
//! ```
//!
//! Each peer owns its record and is the only writer of it, so a
//! per-peer clock is enough to order updates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::AwarenessConfig;
use crate::protocol::{decode_payload, encode_payload, PeerId, ProtocolError};

/// Colors handed out when no palette is configured.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#bcbd22",
    "#008080", "#9a6324", "#800000", "#000075",
];

/// Caret or selection in char offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: usize,
    pub head: usize,
}

impl CursorRange {
    pub fn caret(pos: usize) -> Self {
        Self {
            anchor: pos,
            head: pos,
        }
    }

    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// Who a session belongs to, as resolved by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    pub avatar: Option<String>,
    /// Stable seed for color selection; random per session when absent
    pub color_seed: Option<u64>,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_color_seed(mut self, seed: u64) -> Self {
        self.color_seed = Some(seed);
        self
    }
}

/// A peer's awareness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
    pub avatar: Option<String>,
}

impl PresenceState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            cursor: None,
            avatar: None,
        }
    }

    pub fn for_identity(identity: &UserIdentity, color: impl Into<String>) -> Self {
        Self {
            name: identity.name.clone(),
            color: color.into(),
            cursor: None,
            avatar: identity.avatar.clone(),
        }
    }
}

/// Awareness payload carried inside `SyncMessage::Awareness`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessUpdate {
    State {
        peer: PeerId,
        clock: u64,
        state: PresenceState,
    },
    /// Clean leave
    Remove { peer: PeerId, clock: u64 },
}

impl AwarenessUpdate {
    pub fn peer(&self) -> PeerId {
        match self {
            AwarenessUpdate::State { peer, .. } | AwarenessUpdate::Remove { peer, .. } => *peer,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            AwarenessUpdate::State { clock, .. } | AwarenessUpdate::Remove { clock, .. } => *clock,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }
}

/// Notification delivered to `on_change` handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Added(PeerId),
    Updated(PeerId),
    Removed(PeerId),
}

/// Handle returned by [`AwarenessTracker::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Entry of the host's "who is here" list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUser {
    pub peer: PeerId,
    pub name: String,
    pub color: String,
    pub avatar: Option<String>,
    pub is_local: bool,
}

type ChangeHandler = Box<dyn Fn(&PresenceChange) + Send + Sync>;

struct RemotePresence {
    state: PresenceState,
    clock: u64,
    last_seen: Instant,
}

/// Highest clock seen for a removed peer.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    clock: u64,
    since: Instant,
}

/// Tracks the local record and every remote peer's last known record.
pub struct AwarenessTracker {
    local: PeerId,
    local_state: PresenceState,
    local_clock: u64,
    peers: HashMap<PeerId, RemotePresence>,
    /// Removed peers, kept for one liveness window
    tombstones: HashMap<PeerId, Tombstone>,
    liveness_timeout: Duration,
    handlers: Vec<(HandlerId, ChangeHandler)>,
    next_handler: u64,
}

impl AwarenessTracker {
    pub fn new(local: PeerId, state: PresenceState, config: &AwarenessConfig) -> Self {
        Self {
            local,
            local_state: state,
            local_clock: 0,
            peers: HashMap::new(),
            tombstones: HashMap::new(),
            liveness_timeout: config.liveness_timeout(),
            handlers: Vec::new(),
            next_handler: 0,
        }
    }

    /// Replace the local record and return the update to broadcast.
    pub fn set_local_state(&mut self, state: PresenceState) -> AwarenessUpdate {
        self.local_state = state;
        self.local_clock += 1;
        self.emit(PresenceChange::Updated(self.local));
        self.local_update()
    }

    /// Move the local caret or selection.
    pub fn set_local_cursor(&mut self, cursor: Option<CursorRange>) -> AwarenessUpdate {
        let mut state = self.local_state.clone();
        state.cursor = cursor;
        self.set_local_state(state)
    }

    /// Renew the local record so peers keep it alive.
    pub fn heartbeat(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.local_update()
    }

    /// Current local record as an update, without bumping the clock.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate::State {
            peer: self.local,
            clock: self.local_clock,
            state: self.local_state.clone(),
        }
    }

    /// Announce a clean leave.
    pub fn leave_update(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        AwarenessUpdate::Remove {
            peer: self.local,
            clock: self.local_clock,
        }
    }

    /// Apply a peer's update. Returns the resulting change, if any.
    pub fn apply_remote(&mut self, update: AwarenessUpdate, now: Instant) -> Option<PresenceChange> {
        let peer = update.peer();
        if peer == self.local {
            return None;
        }
        let clock = update.clock();
        if self.tombstones.get(&peer).is_some_and(|dead| clock <= dead.clock) {
            log::trace!("Ignoring update {clock} from removed peer {peer}");
            return None;
        }

        let change = match update {
            AwarenessUpdate::State { state, .. } => match self.peers.get_mut(&peer) {
                Some(known) if clock <= known.clock => {
                    log::trace!("Stale awareness clock {clock} from {peer}");
                    return None;
                }
                Some(known) => {
                    known.clock = clock;
                    known.last_seen = now;
                    if known.state == state {
                        return None;
                    }
                    known.state = state;
                    PresenceChange::Updated(peer)
                }
                None => {
                    self.tombstones.remove(&peer);
                    self.peers.insert(
                        peer,
                        RemotePresence {
                            state,
                            clock,
                            last_seen: now,
                        },
                    );
                    log::debug!("Peer {peer} is now present");
                    PresenceChange::Added(peer)
                }
            },
            AwarenessUpdate::Remove { .. } => {
                let known = self.peers.get(&peer)?;
                if clock < known.clock {
                    return None;
                }
                self.peers.remove(&peer);
                self.bury(peer, clock, now);
                log::debug!("Peer {peer} left");
                PresenceChange::Removed(peer)
            }
        };
        self.emit(change);
        Some(change)
    }

    /// Drop a peer immediately (e.g. on `PeerLeft`).
    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        match self.peers.remove(&peer) {
            Some(known) => {
                self.bury(peer, known.clock, Instant::now());
                self.emit(PresenceChange::Removed(peer));
                true
            }
            None => false,
        }
    }

    /// Remove peers not heard from within the liveness timeout, and forget
    /// tombstones older than it.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.liveness_timeout;
        self.tombstones
            .retain(|_, dead| now.saturating_duration_since(dead.since) < timeout);
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for peer in &stale {
            if let Some(known) = self.peers.remove(peer) {
                self.bury(*peer, known.clock, now);
            }
            log::info!("Evicting silent peer {peer}");
            self.emit(PresenceChange::Removed(*peer));
        }
        stale
    }

    fn bury(&mut self, peer: PeerId, clock: u64, since: Instant) {
        self.tombstones.insert(peer, Tombstone { clock, since });
    }

    /// Last known record per peer, local peer included.
    pub fn get_states(&self) -> HashMap<PeerId, PresenceState> {
        let mut states: HashMap<PeerId, PresenceState> = self
            .peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect();
        states.insert(self.local, self.local_state.clone());
        states
    }

    /// Present users, local first, then by name.
    pub fn active_users(&self) -> Vec<ActiveUser> {
        let mut users: Vec<ActiveUser> = self
            .get_states()
            .into_iter()
            .map(|(peer, state)| ActiveUser {
                peer,
                name: state.name,
                color: state.color,
                avatar: state.avatar,
                is_local: peer == self.local,
            })
            .collect();
        users.sort_by(|a, b| {
            b.is_local
                .cmp(&a.is_local)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.peer.cmp(&b.peer))
        });
        users
    }

    pub fn on_change<F>(&mut self, handler: F) -> HandlerId
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    pub fn off_change(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _)| *hid != id);
        self.handlers.len() != before
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local_state
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn emit(&self, change: PresenceChange) {
        for (_, handler) in &self.handlers {
            handler(&change);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Color policy
// ───────────────────────────────────────────────────────────────────

/// Chooses a palette index.
pub trait ColorPicker: Send {
    fn pick(&mut self, palette_len: usize) -> usize;
}

/// Uniform random choice per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPicker;

impl ColorPicker for RandomPicker {
    fn pick(&mut self, palette_len: usize) -> usize {
        rand::thread_rng().gen_range(0..palette_len.max(1))
    }
}

/// Deterministic sequence from a fixed RNG seed.
pub struct SeededPicker {
    rng: StdRng,
}

impl SeededPicker {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ColorPicker for SeededPicker {
    fn pick(&mut self, palette_len: usize) -> usize {
        self.rng.gen_range(0..palette_len.max(1))
    }
}

/// `seed % palette_len`, so one identity keeps its color.
#[derive(Debug, Clone, Copy)]
pub struct IndexPicker {
    seed: u64,
}

impl IndexPicker {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl ColorPicker for IndexPicker {
    fn pick(&mut self, palette_len: usize) -> usize {
        (self.seed % palette_len.max(1) as u64) as usize
    }
}

/// Palette plus selection strategy.
pub struct ColorPolicy {
    palette: Vec<String>,
    picker: Box<dyn ColorPicker>,
}

impl ColorPolicy {
    pub fn new(palette: Vec<String>, picker: impl ColorPicker + 'static) -> Self {
        Self {
            palette,
            picker: Box::new(picker),
        }
    }

    /// Stable color for identities carrying a seed, random otherwise.
    pub fn for_identity(palette: Vec<String>, identity: &UserIdentity) -> Self {
        match identity.color_seed {
            Some(seed) => Self::new(palette, IndexPicker::new(seed)),
            None => Self::new(palette, RandomPicker),
        }
    }

    pub fn pick(&mut self) -> String {
        let index = self.picker.pick(self.palette.len());
        self.palette
            .get(index)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PALETTE[0].to_string())
    }

    pub fn palette(&self) -> &[String] {
        &self.palette
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    fn tracker() -> AwarenessTracker {
        let config = AwarenessConfig {
            liveness_timeout_ms: 1_000,
            ..AwarenessConfig::default()
        };
        AwarenessTracker::new(peer(1), PresenceState::new("Ada", "#e6194b"), &config)
    }

    fn state_update(from: PeerId, clock: u64, name: &str) -> AwarenessUpdate {
        AwarenessUpdate::State {
            peer: from,
            clock,
            state: PresenceState::new(name, "#3cb44b"),
        }
    }

    fn recorder(tracker: &mut AwarenessTracker) -> Arc<Mutex<Vec<PresenceChange>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        tracker.on_change(move |change| sink.lock().unwrap().push(*change));
        log
    }

    #[test]
    fn test_get_states_includes_local() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_remote(state_update(peer(2), 1, "Bo"), now);

        let states = t.get_states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[&peer(1)].name, "Ada");
        assert_eq!(states[&peer(2)].name, "Bo");
    }

    #[test]
    fn test_added_then_updated() {
        let mut t = tracker();
        let log = recorder(&mut t);
        let now = Instant::now();

        assert_eq!(
            t.apply_remote(state_update(peer(2), 1, "Bo"), now),
            Some(PresenceChange::Added(peer(2)))
        );
        assert_eq!(
            t.apply_remote(state_update(peer(2), 2, "Bob"), now),
            Some(PresenceChange::Updated(peer(2)))
        );
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_remote(state_update(peer(2), 5, "new"), now);
        assert_eq!(t.apply_remote(state_update(peer(2), 4, "old"), now), None);
        assert_eq!(t.apply_remote(state_update(peer(2), 5, "same"), now), None);
        assert_eq!(t.get_states()[&peer(2)].name, "new");
    }

    #[test]
    fn test_own_updates_ignored() {
        let mut t = tracker();
        assert_eq!(t.apply_remote(state_update(peer(1), 9, "me"), Instant::now()), None);
        assert_eq!(t.peer_count(), 0);
    }

    #[test]
    fn test_eviction_fires_removed_once() {
        let mut t = tracker();
        let log = recorder(&mut t);
        let start = Instant::now();
        t.apply_remote(state_update(peer(2), 1, "Bo"), start);
        t.apply_remote(state_update(peer(3), 1, "Cy"), start);

        let later = start + Duration::from_millis(600);
        t.apply_remote(state_update(peer(3), 2, "Cy"), later);

        let evicted = t.evict_stale(start + Duration::from_millis(1_100));
        assert_eq!(evicted, vec![peer(2)]);
        assert!(t.evict_stale(start + Duration::from_millis(1_200)).is_empty());

        let removed: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, PresenceChange::Removed(_)))
            .copied()
            .collect();
        assert_eq!(removed, vec![PresenceChange::Removed(peer(2))]);
        assert!(!t.get_states().contains_key(&peer(2)));
    }

    #[test]
    fn test_late_state_after_remove_is_ignored() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_remote(state_update(peer(2), 3, "Bo"), now);
        assert_eq!(
            t.apply_remote(AwarenessUpdate::Remove { peer: peer(2), clock: 4 }, now),
            Some(PresenceChange::Removed(peer(2)))
        );
        assert_eq!(t.apply_remote(state_update(peer(2), 3, "Bo"), now), None);

        // Rejoining with a newer clock is allowed
        assert_eq!(
            t.apply_remote(state_update(peer(2), 5, "Bo"), now),
            Some(PresenceChange::Added(peer(2)))
        );
    }

    #[test]
    fn test_tombstones_expire_after_liveness_window() {
        let mut t = tracker();
        let start = Instant::now();
        for n in 2..12 {
            t.apply_remote(state_update(peer(n), 3, "guest"), start);
            t.apply_remote(AwarenessUpdate::Remove { peer: peer(n), clock: 4 }, start);
        }
        assert_eq!(t.tombstones.len(), 10);

        // Still inside the window: late states stay suppressed
        t.evict_stale(start + Duration::from_millis(500));
        assert_eq!(t.tombstones.len(), 10);
        assert_eq!(t.apply_remote(state_update(peer(2), 3, "guest"), start), None);

        t.evict_stale(start + Duration::from_millis(1_000));
        assert!(t.tombstones.is_empty());
    }

    #[test]
    fn test_remove_peer_and_off_change() {
        let mut t = tracker();
        let log = recorder(&mut t);
        t.apply_remote(state_update(peer(2), 1, "Bo"), Instant::now());
        assert!(t.remove_peer(peer(2)));
        assert!(!t.remove_peer(peer(2)));
        assert_eq!(log.lock().unwrap().len(), 2);

        let id = t.on_change(|_| {});
        assert!(t.off_change(id));
        assert!(!t.off_change(id));
    }

    #[test]
    fn test_local_updates_bump_clock() {
        let mut t = tracker();
        let first = t.set_local_cursor(Some(CursorRange::caret(3)));
        let second = t.heartbeat();
        assert!(second.clock() > first.clock());
        assert_eq!(t.local_state().cursor, Some(CursorRange::caret(3)));

        let leave = t.leave_update();
        assert!(matches!(leave, AwarenessUpdate::Remove { clock, .. } if clock > second.clock()));
    }

    #[test]
    fn test_update_wire_roundtrip() {
        let update = AwarenessUpdate::State {
            peer: peer(7),
            clock: 12,
            state: PresenceState {
                name: "Eve".into(),
                color: "#4363d8".into(),
                cursor: Some(CursorRange::new(4, 1)),
                avatar: Some("https://a.example/eve.png".into()),
            },
        };
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_active_users_local_first() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_remote(state_update(peer(3), 1, "Zed"), now);
        t.apply_remote(state_update(peer(2), 1, "Bo"), now);

        let names: Vec<_> = t.active_users().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Ada", "Bo", "Zed"]);
    }

    #[test]
    fn test_index_picker_is_stable() {
        let palette: Vec<String> = DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect();
        let identity = UserIdentity::new("Ada").with_color_seed(14);
        let mut a = ColorPolicy::for_identity(palette.clone(), &identity);
        let mut b = ColorPolicy::for_identity(palette.clone(), &identity);
        assert_eq!(a.pick(), b.pick());
        assert_eq!(a.pick(), palette[14 % palette.len()]);
    }

    #[test]
    fn test_seeded_picker_is_reproducible() {
        let palette: Vec<String> = DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect();
        let mut a = ColorPolicy::new(palette.clone(), SeededPicker::new(42));
        let mut b = ColorPolicy::new(palette.clone(), SeededPicker::new(42));
        let seq_a: Vec<_> = (0..5).map(|_| a.pick()).collect();
        let seq_b: Vec<_> = (0..5).map(|_| b.pick()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_random_picker_stays_in_palette() {
        let palette = vec!["#000000".to_string(), "#ffffff".to_string()];
        let mut policy = ColorPolicy::new(palette.clone(), RandomPicker);
        for _ in 0..20 {
            assert!(palette.contains(&policy.pick()));
        }
    }

    #[test]
    fn test_empty_palette_falls_back() {
        let mut policy = ColorPolicy::new(Vec::new(), RandomPicker);
        assert_eq!(policy.pick(), DEFAULT_PALETTE[0]);
    }
}
