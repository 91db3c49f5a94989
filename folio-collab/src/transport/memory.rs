//! In-process transport over a shared [`LocalRelay`] hub.
//!
//! Every room is a tokio broadcast channel. The hub answers pings itself
//! and can sever a peer's link (and refuse reconnects) until restored,
//! which is how tests drive the reconnect path without sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};

use super::{
    ConnectionState, Connector, LinkSink, LinkStream, Transport, TransportCore, TransportEvent,
};
use crate::config::TransportConfig;
use crate::error::CollabError;
use crate::protocol::{room_token, MessageType, PeerId, PeerInfo, SyncMessage};

const DEFAULT_ROOM_CAPACITY: usize = 1024;

#[derive(Default)]
struct RelayInner {
    rooms: HashMap<String, broadcast::Sender<SyncMessage>>,
    severed: HashSet<PeerId>,
    kill_switches: HashMap<PeerId, watch::Sender<bool>>,
}

/// In-process message hub shared by [`MemoryTransport`]s.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<Mutex<RelayInner>>,
    capacity: usize,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

impl LocalRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayInner::default())),
            capacity: capacity.max(1),
        }
    }

    /// Build a transport attached to this hub.
    pub fn transport(&self, peer: PeerInfo, config: TransportConfig) -> MemoryTransport {
        MemoryTransport::new(self.clone(), peer, config)
    }

    /// Cut `peer`'s current link and refuse reconnects until [`restore`](Self::restore).
    pub fn sever(&self, peer: PeerId) {
        let mut inner = self.lock();
        inner.severed.insert(peer);
        if let Some(kill) = inner.kill_switches.remove(&peer) {
            let _ = kill.send(true);
        }
        log::debug!("LocalRelay severed {peer}");
    }

    pub fn restore(&self, peer: PeerId) {
        self.lock().severed.remove(&peer);
        log::debug!("LocalRelay restored {peer}");
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Open links currently subscribed to the room.
    pub fn peer_count(&self, token: &str) -> usize {
        self.lock()
            .rooms
            .get(token)
            .map_or(0, |room| room.receiver_count())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, token: &str, peer: PeerId) -> Result<(MemorySink, MemoryStream), String> {
        let mut inner = self.lock();
        if inner.severed.contains(&peer) {
            return Err(format!("link for {peer} is severed"));
        }
        let room = inner
            .rooms
            .entry(token.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let (kill_tx, kill_rx) = watch::channel(false);
        inner.kill_switches.insert(peer, kill_tx);
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();

        let stream = MemoryStream {
            room: room.subscribe(),
            direct: direct_rx,
            severed: kill_rx.clone(),
        };
        let sink = MemorySink {
            room,
            direct: direct_tx,
            severed: kill_rx,
        };
        Ok((sink, stream))
    }
}

struct MemoryConnector {
    relay: LocalRelay,
    token: String,
    peer: PeerId,
}

impl Connector for MemoryConnector {
    type Sink = MemorySink;
    type Stream = MemoryStream;

    async fn open(&mut self, join: &SyncMessage) -> Result<(MemorySink, MemoryStream), String> {
        let (mut sink, stream) = self.relay.attach(&self.token, self.peer)?;
        sink.send_msg(join).await?;
        Ok((sink, stream))
    }
}

pub(crate) struct MemorySink {
    room: broadcast::Sender<SyncMessage>,
    direct: mpsc::UnboundedSender<SyncMessage>,
    severed: watch::Receiver<bool>,
}

impl LinkSink for MemorySink {
    async fn send_msg(&mut self, msg: &SyncMessage) -> Result<(), String> {
        if *self.severed.borrow() {
            return Err("link severed".into());
        }
        if msg.msg_type == MessageType::Ping {
            return self
                .direct
                .send(SyncMessage::pong(PeerId::nil()))
                .map_err(|e| e.to_string());
        }
        // No subscribers is not an error: the room is simply empty
        let _ = self.room.send(msg.clone());
        Ok(())
    }

    async fn close(&mut self) {}
}

pub(crate) struct MemoryStream {
    room: broadcast::Receiver<SyncMessage>,
    direct: mpsc::UnboundedReceiver<SyncMessage>,
    severed: watch::Receiver<bool>,
}

impl LinkStream for MemoryStream {
    async fn recv_msg(&mut self) -> Option<Result<SyncMessage, String>> {
        loop {
            if *self.severed.borrow() {
                return Some(Err("link severed".into()));
            }
            tokio::select! {
                changed = self.severed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                direct = self.direct.recv() => return direct.map(Ok),
                msg = self.room.recv() => match msg {
                    Ok(msg) => return Some(Ok(msg)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Local link lagged, {n} message(s) dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// Transport over a [`LocalRelay`].
pub struct MemoryTransport {
    core: TransportCore,
    relay: LocalRelay,
}

impl MemoryTransport {
    pub fn new(relay: LocalRelay, peer: PeerInfo, config: TransportConfig) -> Self {
        Self {
            core: TransportCore::new(peer, config),
            relay,
        }
    }

    pub fn relay(&self) -> &LocalRelay {
        &self.relay
    }

    pub fn offline_queue_len(&self) -> usize {
        self.core.offline_queue_len()
    }
}

impl Transport for MemoryTransport {
    async fn connect(&mut self, doc_id: &str, room_secret: &str) -> Result<(), CollabError> {
        let connector = MemoryConnector {
            relay: self.relay.clone(),
            token: room_token(doc_id, room_secret),
            peer: self.core.peer().peer_id,
        };
        self.core.start(connector, doc_id, room_secret).await
    }

    fn broadcast(&self, msg: SyncMessage) -> Result<(), CollabError> {
        self.core.broadcast(msg)
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.core.take_event_rx()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn peer_id(&self) -> PeerId {
        self.core.peer().peer_id
    }

    async fn disconnect(&mut self) {
        self.core.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_message(rx: &mut mpsc::Receiver<TransportEvent>) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(TransportEvent::Message(msg)) => return msg,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no message within timeout")
    }

    async fn wait_for_state(rx: &mut mpsc::Receiver<TransportEvent>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(TransportEvent::StateChanged(s)) if s == want => return,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("state not reached within timeout")
    }

    #[tokio::test]
    async fn test_connect_returns_with_unread_single_slot_channel() {
        let relay = LocalRelay::default();
        let mut config = crate::config::CollabConfig::for_testing().transport;
        config.event_capacity = 1;
        let mut a = relay.transport(PeerInfo::new("Ada"), config.clone());
        let _rx = a.take_event_rx().unwrap();

        let connected = tokio::time::timeout(Duration::from_secs(2), a.connect("doc", "secret")).await;
        assert!(matches!(connected, Ok(Ok(()))));
        assert_eq!(a.state(), ConnectionState::Connected);

        let mut b = relay.transport(PeerInfo::new("Bo"), config);
        let _rx = b.take_event_rx().unwrap();
        relay.sever(b.peer_id());
        let refused = tokio::time::timeout(Duration::from_secs(2), b.connect("doc", "secret")).await;
        assert!(matches!(refused, Ok(Err(CollabError::Connection(_)))));

        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_messages_reach_other_peers_only() {
        let relay = LocalRelay::default();
        let config = crate::config::CollabConfig::for_testing().transport;
        let mut a = relay.transport(PeerInfo::new("Ada"), config.clone());
        let mut b = relay.transport(PeerInfo::new("Bo"), config);
        let mut a_rx = a.take_event_rx().unwrap();
        let mut b_rx = b.take_event_rx().unwrap();

        a.connect("doc", "secret").await.unwrap();
        b.connect("doc", "secret").await.unwrap();
        assert_eq!(relay.room_count(), 1);

        // A sees B's join
        let joined = next_message(&mut a_rx).await;
        assert_eq!(joined.msg_type, MessageType::PeerJoined);
        assert_eq!(joined.peer_id, b.peer_id());

        a.broadcast(SyncMessage::sync_step1(a.peer_id(), "doc", vec![0])).unwrap();
        let got = next_message(&mut b_rx).await;
        assert_eq!(got.msg_type, MessageType::SyncStep1);
        assert_eq!(got.peer_id, a.peer_id());

        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_different_secrets_never_meet() {
        let relay = LocalRelay::default();
        let config = crate::config::CollabConfig::for_testing().transport;
        let mut a = relay.transport(PeerInfo::new("Ada"), config.clone());
        let mut b = relay.transport(PeerInfo::new("Bo"), config);
        a.connect("doc", "one").await.unwrap();
        b.connect("doc", "two").await.unwrap();
        assert_eq!(relay.room_count(), 2);
        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_sever_triggers_reconnect() {
        let relay = LocalRelay::default();
        let config = crate::config::CollabConfig::for_testing().transport;
        let mut a = relay.transport(PeerInfo::new("Ada"), config);
        let mut rx = a.take_event_rx().unwrap();
        a.connect("doc", "secret").await.unwrap();
        assert_eq!(a.state(), ConnectionState::Connected);

        relay.sever(a.peer_id());
        wait_for_state(&mut rx, ConnectionState::Reconnecting).await;

        // Offline operations queue up
        let mut op = SyncMessage::sync_step2(a.peer_id(), "doc", vec![7]);
        op.msg_type = MessageType::Operation;
        a.broadcast(op).unwrap();
        assert_eq!(a.offline_queue_len(), 1);

        relay.restore(a.peer_id());
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.offline_queue_len(), 0);

        a.disconnect().await;
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_reconnecting() {
        let relay = LocalRelay::default();
        let peer = PeerInfo::new("Ada");
        relay.sever(peer.peer_id);

        let mut a = relay.transport(peer, crate::config::CollabConfig::for_testing().transport);
        assert!(a.connect("doc", "secret").await.is_err());
        assert_eq!(a.state(), ConnectionState::Reconnecting);

        tokio::time::timeout(Duration::from_secs(1), a.disconnect())
            .await
            .expect("disconnect must not hang");
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_idle_link_stays_up_via_relay_pongs() {
        let relay = LocalRelay::default();
        let mut config = crate::config::CollabConfig::for_testing().transport;
        config.heartbeat_interval_ms = 20;
        config.idle_timeout_ms = 100;
        let mut a = relay.transport(PeerInfo::new("Ada"), config);
        a.connect("doc", "secret").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.state(), ConnectionState::Connected);
        a.disconnect().await;
    }
}
