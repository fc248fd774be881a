//! In-memory websocket peer and connector for tests.
//!
//! Both ends speak real websocket frames over `tokio::io::duplex`, so the
//! reader/writer tasks run exactly as they would against the backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::client::Connector;
use super::connection::{establish, ConnectError, ConnectionHandle, InboundEvent};
use super::protocol::ClientEvent;

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected (client, server) websocket pair.
pub async fn duplex_pair() -> (WebSocketStream<DuplexStream>, FakePeer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, FakePeer { ws: server })
}

/// Backend side of a [`duplex_pair`].
pub struct FakePeer {
    ws: WebSocketStream<DuplexStream>,
}

impl FakePeer {
    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("peer send");
    }

    /// Next text frame as JSON.
    pub async fn recv(&mut self) -> Value {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("peer recv timed out")
                .expect("stream ended")
                .expect("peer recv");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
            }
        }
    }

    /// Next text frame that is not an audio append.
    pub async fn recv_control(&mut self) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] != "input_audio_buffer.append" {
                return frame;
            }
        }
    }

    /// Assert that no control frame arrives within `window`.  Audio appends
    /// are ignored.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).expect("JSON");
                    assert_eq!(
                        frame["type"], "input_audio_buffer.append",
                        "unexpected frame {frame}"
                    );
                }
                Ok(Some(Ok(Message::Close(frame)))) => panic!("unexpected close: {frame:?}"),
                Ok(Some(Ok(_))) => {}
                Ok(other) => panic!("connection ended: {other:?}"),
            }
        }
    }

    /// Wait for the client's close frame (or the stream ending).
    pub async fn recv_close(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// [`Connector`] that hands the server end of each new connection to the
/// test through a channel.
pub struct DuplexConnector {
    peers: mpsc::UnboundedSender<FakePeer>,
    handshake_timeout: Duration,
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
}

impl DuplexConnector {
    pub fn new(handshake_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<FakePeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                handshake_timeout,
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(
        &self,
        setup: Vec<ClientEvent>,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectError::Refused("connection refused".into()));
        }
        let (client, peer) = duplex_pair().await;
        let _ = self.peers.send(peer);
        establish(client, setup, events, self.handshake_timeout).await
    }
}
