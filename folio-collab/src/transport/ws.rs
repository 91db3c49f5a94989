//! WebSocket transport against a [`SyncServer`](crate::server::SyncServer) relay.
//!
//! The room token is appended to the relay URL as a path segment
//! (`ws://host:port/{room_token}`), and the first binary frame on the
//! socket is the `PeerJoined` announcement.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    ConnectionState, Connector, LinkSink, LinkStream, Transport, TransportCore, TransportEvent,
};
use crate::config::TransportConfig;
use crate::error::CollabError;
use crate::protocol::{room_token, PeerId, PeerInfo, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnector {
    url: String,
}

impl Connector for WsConnector {
    type Sink = SplitSink<WsStream, Message>;
    type Stream = SplitStream<WsStream>;

    async fn open(&mut self, join: &SyncMessage) -> Result<(Self::Sink, Self::Stream), String> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("{}: {e}", self.url))?;
        let (mut sink, stream) = ws.split();
        sink.send_msg(join).await?;
        Ok((sink, stream))
    }
}

impl LinkSink for SplitSink<WsStream, Message> {
    async fn send_msg(&mut self, msg: &SyncMessage) -> Result<(), String> {
        let bytes = msg.encode().map_err(|e| e.to_string())?;
        self.send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

impl LinkStream for SplitStream<WsStream> {
    async fn recv_msg(&mut self) -> Option<Result<SyncMessage, String>> {
        loop {
            match self.next().await? {
                Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                    Ok(msg) => return Some(Ok(msg)),
                    Err(e) => log::warn!("Dropping malformed frame: {e}"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.to_string())),
            }
        }
    }
}

/// Transport speaking the binary sync protocol over WebSocket.
pub struct WsTransport {
    core: TransportCore,
}

impl WsTransport {
    pub fn new(peer: PeerInfo, config: TransportConfig) -> Self {
        Self {
            core: TransportCore::new(peer, config),
        }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        self.core.peer()
    }

    pub fn server_url(&self) -> &str {
        &self.core.config().server_url
    }

    /// Operations waiting for a connection.
    pub fn offline_queue_len(&self) -> usize {
        self.core.offline_queue_len()
    }

    fn room_url(&self, doc_id: &str, room_secret: &str) -> String {
        format!(
            "{}/{}",
            self.server_url().trim_end_matches('/'),
            room_token(doc_id, room_secret)
        )
    }
}

impl Transport for WsTransport {
    async fn connect(&mut self, doc_id: &str, room_secret: &str) -> Result<(), CollabError> {
        let connector = WsConnector {
            url: self.room_url(doc_id, room_secret),
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
