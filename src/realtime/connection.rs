//! Duplex websocket connection to the realtime backend.
//!
//! Configuration (`session.update`) is queued before the socket opens and
//! can only leave the queue once the peer has sent `session.created`.  All
//! socket writes go through the single writer task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::auth::AuthError;
use super::protocol::{decode_audio, parse_server_event, ClientEvent, PeerError, ServerEvent};

// ---------------------------------------------------------------------------
// ConnectError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not obtain credentials: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid connection request: {0}")]
    Request(String),

    #[error("transport refused: {0}")]
    Refused(String),

    #[error("transport did not open within {0:?}")]
    ConnectTimeout(Duration),

    #[error("peer did not confirm the session within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("connection closed before the session was confirmed")]
    ClosedDuringHandshake,

    #[error("backend rejected the session: {0}")]
    Peer(PeerError),
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

/// Lifecycle frames consumed by the voice state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    SessionCreated,
    SessionUpdated,
    ResponseStarted,
    ResponseDone,
    SpeechStarted,
    SpeechStopped,
    BufferCommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    /// What the assistant is saying (streamed deltas).
    Assistant,
    /// What the user said (one completed transcription per turn).
    User,
}

/// One routed inbound frame, or the end of the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Lifecycle(Lifecycle),
    /// Decoded PCM16 for the playback buffer.
    Audio(Vec<u8>),
    Transcript { source: TranscriptSource, text: String },
    PeerError(PeerError),
    /// The socket closed without us asking.
    Closed { abnormal: bool, reason: String },
}

/// Route a parsed frame.  `None` for frames nobody downstream consumes.
pub fn dispatch(event: ServerEvent) -> Option<InboundEvent> {
    let routed = match event {
        ServerEvent::SessionCreated { .. } => InboundEvent::Lifecycle(Lifecycle::SessionCreated),
        ServerEvent::SessionUpdated => InboundEvent::Lifecycle(Lifecycle::SessionUpdated),
        ServerEvent::ResponseCreated => InboundEvent::Lifecycle(Lifecycle::ResponseStarted),
        ServerEvent::ResponseDone => InboundEvent::Lifecycle(Lifecycle::ResponseDone),
        ServerEvent::SpeechStarted => InboundEvent::Lifecycle(Lifecycle::SpeechStarted),
        ServerEvent::SpeechStopped => InboundEvent::Lifecycle(Lifecycle::SpeechStopped),
        ServerEvent::BufferCommitted => InboundEvent::Lifecycle(Lifecycle::BufferCommitted),
        ServerEvent::AudioDelta { delta } => match decode_audio(&delta) {
            Ok(pcm) => InboundEvent::Audio(pcm),
            Err(e) => {
                warn!("realtime: audio delta skipped: {e}");
                return None;
            }
        },
        ServerEvent::AudioTranscriptDelta { delta } => InboundEvent::Transcript {
            source: TranscriptSource::Assistant,
            text: delta,
        },
        ServerEvent::InputTranscriptCompleted { transcript } => InboundEvent::Transcript {
            source: TranscriptSource::User,
            text: transcript,
        },
        ServerEvent::Error { error } => InboundEvent::PeerError(error.into()),
        ServerEvent::RateLimitsUpdated { rate_limits } => {
            for limit in &rate_limits {
                debug!(
                    "realtime: rate limit {} remaining {:?} (reset {:?}s)",
                    limit.name, limit.remaining, limit.reset_seconds
                );
            }
            return None;
        }
        ServerEvent::Unknown => return None,
    };
    Some(routed)
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

enum WriterCommand {
    Send(ClientEvent),
    Close,
}

struct Outbox {
    open: bool,
    ready: bool,
    closing: bool,
    pending: VecDeque<ClientEvent>,
}

struct HandleInner {
    writer: mpsc::UnboundedSender<WriterCommand>,
    outbox: Mutex<Outbox>,
    reader: Mutex<Option<AbortHandle>>,
}

/// Sender side of an established connection.  Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outbox = self.outbox();
        f.debug_struct("ConnectionHandle")
            .field("open", &outbox.open)
            .field("ready", &outbox.ready)
            .field("pending", &outbox.pending.len())
            .finish()
    }
}

impl ConnectionHandle {
    fn new(writer: mpsc::UnboundedSender<WriterCommand>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                writer,
                outbox: Mutex::new(Outbox {
                    open: true,
                    ready: false,
                    closing: false,
                    pending: VecDeque::new(),
                }),
                reader: Mutex::new(None),
            }),
        }
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a control message, queueing it until the peer is ready.
    pub fn send_control(&self, event: ClientEvent) {
        let mut outbox = self.outbox();
        if !outbox.open {
            warn!("realtime: dropping {}, not connected", event.tag());
            return;
        }
        if !outbox.ready {
            debug!("realtime: queueing {} until session is ready", event.tag());
            outbox.pending.push_back(event);
            return;
        }
        self.write(event);
    }

    /// Send a chunk of wire PCM.  Dropped unless the session is ready.
    pub fn send_audio(&self, pcm: &[u8]) {
        let outbox = self.outbox();
        if !outbox.open || !outbox.ready {
            warn!("realtime: dropping {} bytes of audio, session not ready", pcm.len());
            return;
        }
        self.write(ClientEvent::audio(pcm));
    }

    /// A user text turn followed by a response request.
    pub fn send_text(&self, text: &str) {
        self.send_control(ClientEvent::user_text(text));
        self.send_control(ClientEvent::ResponseCreate);
    }

    pub fn commit_turn(&self) {
        self.send_control(ClientEvent::InputAudioCommit);
    }

    pub fn request_response(&self) {
        self.send_control(ClientEvent::ResponseCreate);
    }

    pub fn is_open(&self) -> bool {
        self.outbox().open
    }

    pub fn is_ready(&self) -> bool {
        let outbox = self.outbox();
        outbox.open && outbox.ready
    }

    /// Close the socket.  Idempotent.  No [`InboundEvent::Closed`] is
    /// reported for a close we asked for.
    pub fn close(&self) {
        {
            let mut outbox = self.outbox();
            if outbox.closing {
                return;
            }
            outbox.closing = true;
            outbox.open = false;
            outbox.pending.clear();
        }
        let _ = self.inner.writer.send(WriterCommand::Close);
        if let Some(reader) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reader.abort();
        }
        info!("realtime: connection closed");
    }

    /// Mark the peer ready and flush queued control messages in order.
    /// Returns `false` if it was already ready.
    fn mark_ready(&self) -> bool {
        let mut outbox = self.outbox();
        if outbox.ready || !outbox.open {
            return false;
        }
        outbox.ready = true;
        let queued = outbox.pending.len();
        while let Some(event) = outbox.pending.pop_front() {
            self.write(event);
        }
        debug!("realtime: session ready, flushed {queued} queued message(s)");
        true
    }

    /// Reader exited: the socket is gone.  Returns whether we closed it.
    fn mark_closed(&self) -> bool {
        let mut outbox = self.outbox();
        outbox.open = false;
        outbox.pending.clear();
        outbox.closing
    }

    /// Caller holds the outbox lock, which keeps writer order equal to
    /// send order.
    fn write(&self, event: ClientEvent) {
        if self.inner.writer.send(WriterCommand::Send(event)).is_err() {
            warn!("realtime: writer gone, message dropped");
        }
    }

    fn set_reader(&self, handle: AbortHandle) {
        *self.inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

// ---------------------------------------------------------------------------
// establish
// ---------------------------------------------------------------------------

/// Drive an already-open websocket through the session handshake.
///
/// `setup` messages are queued immediately and flushed once `session.created`
/// arrives.  Inbound frames are routed to `events` for the lifetime of the
/// connection.
///
/// # Errors
///
/// [`ConnectError::HandshakeTimeout`] if `session.created` does not arrive in
/// time, [`ConnectError::Peer`] if the backend answers with an `error` frame
/// first, [`ConnectError::ClosedDuringHandshake`] if the socket drops.
pub async fn establish<S>(
    socket: S,
    setup: Vec<ClientEvent>,
    events: mpsc::UnboundedSender<InboundEvent>,
    handshake_timeout: Duration,
) -> Result<ConnectionHandle, ConnectError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    let (sink, stream) = socket.split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(writer_tx);
    for event in setup {
        handle.send_control(event);
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(write_loop(sink, writer_rx));
    let reader = tokio::spawn(read_loop(stream, handle.clone(), events, ready_tx));
    handle.set_reader(reader.abort_handle());

    match timeout(handshake_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => {
            info!("realtime: session established");
            Ok(handle)
        }
        Ok(Ok(Err(peer))) => {
            handle.close();
            Err(ConnectError::Peer(peer))
        }
        Ok(Err(_)) => {
            handle.close();
            Err(ConnectError::ClosedDuringHandshake)
        }
        Err(_) => {
            handle.close();
            Err(ConnectError::HandshakeTimeout(handshake_timeout))
        }
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<WriterCommand>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("realtime: could not encode {}: {e}", event.tag());
                        continue;
                    }
                };
                if !event.is_audio() {
                    debug!("realtime: → {}", event.tag());
                }
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("realtime: write failed: {e}");
                    break;
                }
            }
            WriterCommand::Close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
}

async fn read_loop<S>(
    mut stream: S,
    handle: ConnectionHandle,
    events: mpsc::UnboundedSender<InboundEvent>,
    ready_tx: oneshot::Sender<Result<(), PeerError>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut ready_tx = Some(ready_tx);
    let mut abnormal = true;
    let mut reason = String::from("stream ended");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => {
                warn!("realtime: ignoring {} byte binary frame", bytes.len());
                continue;
            }
            Ok(Message::Close(frame)) => {
                abnormal = frame
                    .as_ref()
                    .map_or(false, |f| f.code != CloseCode::Normal);
                reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "closed".into());
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                reason = e.to_string();
                break;
            }
        };

        let (event, tag) = match parse_server_event(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("realtime: skipping frame: {e}");
                continue;
            }
        };

        match &event {
            ServerEvent::SessionCreated { session } => {
                if handle.mark_ready() {
                    info!("realtime: session created ({})", session.id.as_deref().unwrap_or("?"));
                }
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            ServerEvent::Error { error } if ready_tx.is_some() => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(error.clone().into()));
                }
                continue;
            }
            ServerEvent::Unknown => {
                debug!("realtime: ignoring unhandled `{tag}` frame");
            }
            _ => {}
        }

        if let Some(routed) = dispatch(event) {
            if events.send(routed).is_err() {
                debug!("realtime: event receiver gone, stopping reader");
                return;
            }
        }
    }

    if handle.mark_closed() {
        return;
    }
    if abnormal {
        warn!("realtime: connection lost: {reason}");
    } else {
        info!("realtime: peer closed the connection: {reason}");
    }
    let _ = events.send(InboundEvent::Closed { abnormal, reason });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::realtime::testing::{duplex_pair, FakePeer};

    const HANDSHAKE: Duration = Duration::from_secs(10);

    async fn connect_with(
        setup: Vec<ClientEvent>,
    ) -> (
        tokio::task::JoinHandle<Result<ConnectionHandle, ConnectError>>,
        FakePeer,
        mpsc::UnboundedReceiver<InboundEvent>,
    ) {
        let (client, peer) = duplex_pair().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(establish(client, setup, tx, HANDSHAKE));
        (task, peer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn setup_waits_for_session_created() {
        let (task, mut peer, _rx) = connect_with(vec![ClientEvent::InputAudioCommit]).await;

        peer.expect_silence(Duration::from_secs(1)).await;
        peer.send(json!({"type": "session.created", "session": {"id": "s1"}}))
            .await;

        let first = peer.recv().await;
        assert_eq!(first["type"], "input_audio_buffer.commit");
        let handle = task.await.unwrap().unwrap();
        assert!(handle.is_ready());

        // A second session.created does not replay anything.
        peer.send(json!({"type": "session.created"})).await;
        peer.expect_silence(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_controls_flush_in_order() {
        let (task, mut peer, _rx) = connect_with(vec![
            ClientEvent::ResponseCreate,
            ClientEvent::user_text("a"),
            ClientEvent::InputAudioCommit,
        ])
        .await;
        peer.send(json!({"type": "session.created"})).await;

        assert_eq!(peer.recv().await["type"], "response.create");
        assert_eq!(peer.recv().await["type"], "conversation.item.create");
        assert_eq!(peer.recv().await["type"], "input_audio_buffer.commit");
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn debug_shows_outbox_state() {
        let (task, mut peer, _rx) = connect_with(vec![ClientEvent::ResponseCreate]).await;
        peer.send(json!({"type": "session.created"})).await;
        let handle = task.await.unwrap().unwrap();

        let shown = format!("{handle:?}");
        assert!(shown.contains("open: true"));
        assert!(shown.contains("ready: true"));
        assert!(shown.contains("pending: 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (task, _peer, _rx) = connect_with(vec![]).await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeTimeout(d) if d == HANDSHAKE));
    }

    #[tokio::test(start_paused = true)]
    async fn error_before_ready_fails_connect() {
        let (task, mut peer, _rx) = connect_with(vec![]).await;
        peer.send(json!({"type": "error", "error": {"message": "bad key"}}))
            .await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectError::Peer(p) if p.message == "bad key"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_do_not_kill_the_connection() {
        let (task, mut peer, mut rx) = connect_with(vec![]).await;
        peer.send_raw("{not json").await;
        peer.send(json!({"typ": "unknown_x"})).await;
        peer.send(json!({"type": "response.text.delta", "delta": "x"}))
            .await;
        peer.send(json!({"type": "session.created"})).await;
        let handle = task.await.unwrap().unwrap();

        peer.send(json!({"type": "response.created"})).await;
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Lifecycle(Lifecycle::SessionCreated))
        );
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Lifecycle(Lifecycle::ResponseStarted))
        );
        assert!(handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn audio_flows_only_while_open() {
        let (task, mut peer, _rx) = connect_with(vec![]).await;
        peer.send(json!({"type": "session.created"})).await;
        let handle = task.await.unwrap().unwrap();

        handle.send_audio(&[1, 0, 2, 0]);
        let frame = peer.recv().await;
        assert_eq!(frame["type"], "input_audio_buffer.append");
        assert_eq!(frame["audio"], "AQACAA==");

        handle.close();
        handle.send_audio(&[1, 0]);
        handle.commit_turn();
        assert!(!handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_are_routed() {
        let (task, mut peer, mut rx) = connect_with(vec![]).await;
        peer.send(json!({"type": "session.created"})).await;
        task.await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(InboundEvent::Lifecycle(_))));

        peer.send(json!({"type": "response.audio.delta", "delta": "AQACAA=="}))
            .await;
        peer.send(json!({"type": "response.audio_transcript.delta", "delta": "Hi"}))
            .await;
        peer.send(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "hello"
        }))
        .await;
        peer.send(json!({"type": "error", "error": {"message": "oops"}}))
            .await;

        assert_eq!(rx.recv().await, Some(InboundEvent::Audio(vec![1, 0, 2, 0])));
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Transcript {
                source: TranscriptSource::Assistant,
                text: "Hi".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Transcript {
                source: TranscriptSource::User,
                text: "hello".into()
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(InboundEvent::PeerError(PeerError { message, .. })) if message == "oops"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_drop_is_reported_as_abnormal() {
        let (task, mut peer, mut rx) = connect_with(vec![]).await;
        peer.send(json!({"type": "session.created"})).await;
        let handle = task.await.unwrap().unwrap();
        rx.recv().await;

        drop(peer);
        assert!(matches!(
            rx.recv().await,
            Some(InboundEvent::Closed { abnormal: true, .. })
        ));
        assert!(!handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_is_not_reported() {
        let (task, mut peer, mut rx) = connect_with(vec![]).await;
        peer.send(json!({"type": "session.created"})).await;
        let handle = task.await.unwrap().unwrap();
        rx.recv().await;

        handle.close();
        handle.close();
        assert!(peer.recv_close().await);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn rate_limits_and_unknown_are_not_routed() {
        assert_eq!(dispatch(ServerEvent::Unknown), None);
        assert_eq!(
            dispatch(ServerEvent::RateLimitsUpdated {
                rate_limits: Vec::new()
            }),
            None
        );
        assert_eq!(
            dispatch(ServerEvent::AudioDelta {
                delta: "%%%".into()
            }),
            None
        );
    }
}
