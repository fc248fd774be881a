//! Session orchestrator: one task that owns the state machine, the
//! connection and both audio pipelines.
//!
//! [`VoiceSession::run`] multiplexes handle commands, inbound frames and
//! results from its own background tasks.  Connecting, playback and the
//! settle delay run in spawned tasks tagged with a generation or turn
//! counter, so results from a torn-down connection or an abandoned turn
//! are ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::observer::{ErrorKind, SessionObserver};
use super::state::{CaptureAction, Transition, VoiceEvent, VoiceState, VoiceStateMachine};
use crate::audio::{
    AudioInput, AudioOutput, CaptureError, CaptureGate, CapturePipeline, ChunkSink, LevelCallback,
    PlaybackError, PlaybackOutcome, PlaybackPipeline,
};
use crate::config::AppConfig;
use crate::realtime::protocol::session_update;
use crate::realtime::{
    ConnectError, ConnectionHandle, Connector, InboundEvent, Lifecycle, PeerError,
};

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session task has shut down")]
    Closed,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("backend error: {0}")]
    Peer(#[from] PeerError),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl SessionError {
    /// Category reported to the observer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Closed | SessionError::ConnectionLost(_) => ErrorKind::Connection,
            SessionError::Connect(ConnectError::Auth(_)) => ErrorKind::Auth,
            SessionError::Connect(ConnectError::Peer(_)) => ErrorKind::Peer,
            SessionError::Connect(_) => ErrorKind::Connection,
            SessionError::Capture(CaptureError::PermissionDenied) => ErrorKind::Permission,
            SessionError::Capture(_) => ErrorKind::Capture,
            SessionError::Playback(_) => ErrorKind::Playback,
            SessionError::Peer(_) => ErrorKind::Peer,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Connect and begin the conversation.  `context` is appended to the
    /// session instructions.
    Start { context: Option<String> },
    Mute,
    Unmute,
    /// Commit the user's turn and ask for a reply.
    EndTurn,
    SendText(String),
    /// Tear the session down to `Idle`.  The task keeps running.
    Stop,
    /// Tear down and exit [`VoiceSession::run`].
    Shutdown,
}

/// Cloneable controller for a running [`VoiceSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<VoiceState>,
}

impl SessionHandle {
    pub async fn start(&self, context: Option<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Start { context }).await
    }

    pub async fn mute(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Mute).await
    }

    pub async fn unmute(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Unmute).await
    }

    pub async fn end_turn(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::EndTurn).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SendText(text.into())).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Current voice state.
    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    /// A receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for(&self, target: VoiceState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Glue between capture and the session
// ---------------------------------------------------------------------------

/// Results from tasks spawned by the session.
enum Internal {
    Connected {
        generation: u64,
        result: Result<ConnectionHandle, ConnectError>,
    },
    PlaybackFinished {
        turn: u64,
        result: Result<PlaybackOutcome, PlaybackError>,
    },
    Settled {
        turn: u64,
    },
    ReadyTimeout {
        generation: u64,
    },
    CaptureFailed(CaptureError),
}

/// The live connection, as seen by the capture pipeline.
#[derive(Clone, Default)]
struct Outbound {
    slot: Arc<Mutex<Option<ConnectionHandle>>>,
}

impl Outbound {
    fn set(&self, connection: Option<ConnectionHandle>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = connection;
    }

    fn get(&self) -> Option<ConnectionHandle> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChunkSink for Outbound {
    async fn send_audio(&self, pcm: Vec<u8>) {
        match self.get() {
            Some(connection) => connection.send_audio(&pcm),
            None => warn!("session: dropping {} bytes of audio, not connected", pcm.len()),
        }
    }

    async fn commit_turn(&self) {
        match self.get() {
            Some(connection) => connection.commit_turn(),
            None => warn!("session: dropping turn commit, not connected"),
        }
    }
}

struct SessionGate {
    state: watch::Receiver<VoiceState>,
    playback: Arc<PlaybackPipeline>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl CaptureGate for SessionGate {
    fn may_record(&self) -> bool {
        *self.state.borrow() == VoiceState::Listening && !self.playback.is_playing()
    }

    fn capture_failed(&self, err: CaptureError) {
        let _ = self.internal.send(Internal::CaptureFailed(err));
    }
}

// ---------------------------------------------------------------------------
// VoiceSession
// ---------------------------------------------------------------------------

/// External collaborators of a session.
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub input: Arc<dyn AudioInput>,
    pub output: Arc<dyn AudioOutput>,
    pub observer: Arc<dyn SessionObserver>,
}

/// One voice conversation.  Create with [`VoiceSession::new`], spawn
/// [`run`](Self::run), drive it through the returned [`SessionHandle`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use voice_session::audio::{CpalInput, CpalOutput};
/// use voice_session::config::AppConfig;
/// use voice_session::realtime::{provider_from_config, WebSocketConnector};
/// use voice_session::session::{LogObserver, SessionDeps, VoiceSession};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = AppConfig::load()?;
/// let tokens = provider_from_config(&config.backend)?;
/// let deps = SessionDeps {
///     connector: Arc::new(WebSocketConnector::new(config.backend.clone(), tokens)),
///     input: Arc::new(CpalInput::new(None)),
///     output: Arc::new(CpalOutput::new(None)),
///     observer: Arc::new(LogObserver),
/// };
/// let (session, handle) = VoiceSession::new(config, deps);
/// tokio::spawn(session.run());
/// handle.start(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct VoiceSession {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn SessionObserver>,
    capture: CapturePipeline,
    playback: Arc<PlaybackPipeline>,
    outbound: Outbound,

    machine: VoiceStateMachine,
    state_tx: watch::Sender<VoiceState>,
    commands: mpsc::Receiver<SessionCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    inbound: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    /// Inbound frames that arrived before the connect result.
    deferred: VecDeque<InboundEvent>,

    connection: Option<ConnectionHandle>,
    connecting: bool,
    awaiting_ready: bool,
    generation: u64,
    turn: u64,
    /// Responses of the current turn not yet done playing.
    playbacks: usize,
    /// Capture was due while the speaker was busy.
    capture_deferred: bool,
    context: Option<String>,
    greeting_sent: bool,
}

impl VoiceSession {
    pub fn new(config: AppConfig, deps: SessionDeps) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VoiceState::Idle);

        let playback = Arc::new(PlaybackPipeline::new(deps.output, config.playback.clone()));
        let outbound = Outbound::default();
        let gate = Arc::new(SessionGate {
            state: state_rx.clone(),
            playback: Arc::clone(&playback),
            internal: internal_tx.clone(),
        });
        let capture = CapturePipeline::new(
            deps.input,
            Arc::new(outbound.clone()),
            gate,
            config.capture.clone(),
        );

        let session = Self {
            config,
            connector: deps.connector,
            observer: deps.observer,
            capture,
            playback,
            outbound,
            machine: VoiceStateMachine::new(),
            state_tx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            inbound: None,
            deferred: VecDeque::new(),
            connection: None,
            connecting: false,
            awaiting_ready: false,
            generation: 0,
            turn: 0,
            playbacks: 0,
            capture_deferred: false,
            context: None,
            greeting_sent: false,
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (session, handle)
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until [`SessionHandle::shutdown`] or every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                event = recv_inbound(&mut self.inbound) => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => self.inbound = None,
                },
            }
        }

        self.teardown(VoiceEvent::Stop).await;
        info!("session: shut down");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        debug!("session: command {command:?}");
        match command {
            SessionCommand::Start { context } => self.start(context),
            SessionCommand::Mute => self.mute().await,
            SessionCommand::Unmute => self.unmute().await,
            SessionCommand::EndTurn => self.end_turn().await,
            SessionCommand::SendText(text) => self.send_text(&text),
            SessionCommand::Stop | SessionCommand::Shutdown => {
                self.teardown(VoiceEvent::Stop).await
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected { generation, result } => {
                self.on_connected(generation, result).await
            }
            Internal::PlaybackFinished { turn, result } => {
                self.on_playback_finished(turn, result).await
            }
            Internal::Settled { turn } => {
                if turn == self.turn && self.playbacks == 0 && !self.playback.is_playing() {
                    if let Some(t) = self.apply(VoiceEvent::PlaybackSettled) {
                        self.perform(t.capture).await;
                    }
                }
            }
            Internal::ReadyTimeout { generation } => {
                if generation == self.generation && self.awaiting_ready {
                    let waited = self.config.backend.handshake_timeout();
                    self.fail(ConnectError::HandshakeTimeout(waited).into()).await;
                }
            }
            Internal::CaptureFailed(err) => {
                if self.machine.state() == VoiceState::Listening {
                    self.fail(err.into()).await;
                } else {
                    warn!("session: capture failed outside a user turn: {err}");
                }
            }
        }
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        if self.connecting {
            self.deferred.push_back(event);
            return;
        }
        match event {
            InboundEvent::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle).await,
            InboundEvent::Audio(pcm) => {
                if self.machine.state() == VoiceState::Speaking {
                    self.playback.on_audio_delta(&pcm);
                } else {
                    debug!("session: audio delta outside a response, dropped");
                }
            }
            InboundEvent::Transcript { source, text } => self.observer.transcript(source, &text),
            InboundEvent::PeerError(err) => self.fail(err.into()).await,
            InboundEvent::Closed { abnormal, reason } => {
                if abnormal {
                    self.fail(SessionError::ConnectionLost(reason)).await;
                } else {
                    info!("session: backend ended the session ({reason})");
                    self.teardown(VoiceEvent::Fault).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    fn start(&mut self, context: Option<String>) {
        if self.machine.state().is_active() || self.connecting || self.connection.is_some() {
            debug!("session: already started");
            return;
        }
        self.context = context;
        self.greeting_sent = false;
        if self.apply(VoiceEvent::SessionStarted).is_some() {
            self.open_connection();
        }
    }

    fn open_connection(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inbound = Some(events_rx);
        self.deferred.clear();
        self.connecting = true;
        self.awaiting_ready = true;

        let setup = vec![session_update(&self.config.backend, self.context.as_deref())];
        let connector = Arc::clone(&self.connector);
        let internal = self.internal_tx.clone();
        info!("session: connecting");
        tokio::spawn(async move {
            let result = connector.connect(setup, events_tx).await;
            let _ = internal.send(Internal::Connected { generation, result });
        });
    }

    async fn on_connected(
        &mut self,
        generation: u64,
        result: Result<ConnectionHandle, ConnectError>,
    ) {
        if generation != self.generation {
            if let Ok(stale) = result {
                debug!("session: closing connection from an abandoned attempt");
                stale.close();
            }
            return;
        }
        self.connecting = false;

        match result {
            Ok(connection) => {
                self.outbound.set(Some(connection.clone()));
                self.connection = Some(connection);

                let wait = self.config.backend.handshake_timeout();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = internal.send(Internal::ReadyTimeout { generation });
                });
                while let Some(event) = self.deferred.pop_front() {
                    self.handle_inbound(event).await;
                }
            }
            Err(err) => self.fail(err.into()).await,
        }
    }

    async fn on_lifecycle(&mut self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::SessionCreated => debug!("session: backend session created"),
            Lifecycle::SessionUpdated => self.on_peer_ready().await,
            Lifecycle::ResponseStarted => {
                if let Some(t) = self.apply(VoiceEvent::ResponseStarted) {
                    self.turn += 1;
                    self.playback.clear();
                    self.perform(t.capture).await;
                }
            }
            Lifecycle::ResponseDone => self.on_response_done(),
            Lifecycle::SpeechStarted => self.observer.speech_activity(true),
            Lifecycle::SpeechStopped => self.observer.speech_activity(false),
            Lifecycle::BufferCommitted => debug!("session: input buffer committed"),
        }
    }

    /// `session.updated`: the configuration is live.
    async fn on_peer_ready(&mut self) {
        if !self.awaiting_ready {
            debug!("session: repeated session.updated ignored");
            return;
        }
        self.awaiting_ready = false;

        if !self.greeting_sent {
            if let (Some(greeting), Some(connection)) =
                (self.config.session.greeting.as_deref(), self.connection.as_ref())
            {
                connection.send_text(greeting);
                info!("session: greeting sent");
            }
            self.greeting_sent = true;
        }

        if let Some(t) = self.apply(VoiceEvent::PeerReady) {
            self.perform(t.capture).await;
        }
    }

    // -----------------------------------------------------------------------
    // Response playback
    // -----------------------------------------------------------------------

    fn on_response_done(&mut self) {
        if self.machine.state() != VoiceState::Speaking {
            self.playback.clear();
            debug!("session: response.done outside Speaking, audio discarded");
            return;
        }
        let turn = self.turn;
        let play = self.playback.on_response_done();
        self.playbacks += 1;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = play.await;
            let _ = internal.send(Internal::PlaybackFinished { turn, result });
        });
    }

    async fn on_playback_finished(
        &mut self,
        turn: u64,
        result: Result<PlaybackOutcome, PlaybackError>,
    ) {
        if self.capture_deferred && !self.playback.is_playing() {
            self.capture_deferred = false;
            if self.machine.state() == VoiceState::Listening {
                self.perform(CaptureAction::Start).await;
            }
        }
        if turn != self.turn || self.machine.state() != VoiceState::Speaking {
            debug!("session: playback result for an abandoned turn");
            return;
        }
        self.playbacks = self.playbacks.saturating_sub(1);
        match result {
            Ok(PlaybackOutcome::Interrupted) => return,
            Ok(outcome) => debug!("session: playback finished: {outcome:?}"),
            Err(err) => self.report(&SessionError::Playback(err)),
        }
        if self.playbacks > 0 {
            debug!("session: {} more response(s) queued", self.playbacks);
            return;
        }

        let settle = self.config.playback.settle_delay();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = internal.send(Internal::Settled { turn });
        });
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    async fn mute(&mut self) {
        if let Some(t) = self.apply(VoiceEvent::Mute) {
            self.perform(t.capture).await;
            self.playback.stop();
            self.turn += 1;
            self.playbacks = 0;
            info!("session: muted");
        }
    }

    async fn unmute(&mut self) {
        let open = self
            .connection
            .as_ref()
            .is_some_and(ConnectionHandle::is_open);
        let ready = open && !self.awaiting_ready;
        let Some(t) = self.apply(VoiceEvent::Unmute { connected: ready }) else {
            debug!("session: not muted");
            return;
        };
        info!("session: unmuted");
        if t.to == VoiceState::Processing && !open && !self.connecting {
            self.open_connection();
        }
        self.perform(t.capture).await;
    }

    async fn end_turn(&mut self) {
        if self.machine.state() != VoiceState::Listening {
            debug!("session: end_turn ignored in {}", self.machine.state());
            return;
        }
        if let Err(err) = self.capture.stop_capturing().await {
            self.fail(err.into()).await;
            return;
        }
        if let Some(connection) = &self.connection {
            connection.request_response();
        }
        self.apply(VoiceEvent::TurnEnded);
    }

    fn send_text(&self, text: &str) {
        match &self.connection {
            Some(connection) if connection.is_open() => connection.send_text(text),
            _ => warn!("session: not connected, text turn dropped"),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions and teardown
    // -----------------------------------------------------------------------

    fn apply(&mut self, event: VoiceEvent) -> Option<Transition> {
        let transition = self.machine.apply(event)?;
        debug!(
            "session: {} → {} on {event:?}",
            transition.from, transition.to
        );
        if transition.from != transition.to {
            self.state_tx.send_replace(transition.to);
            self.observer.state_changed(transition.to);
        }
        Some(transition)
    }

    async fn perform(&mut self, action: CaptureAction) {
        match action {
            CaptureAction::None => {}
            CaptureAction::Start => {
                if self.playback.is_playing() {
                    debug!("session: speaker busy, capture deferred");
                    self.capture_deferred = true;
                    return;
                }
                let observer = Arc::clone(&self.observer);
                let level: LevelCallback = Arc::new(move |l| observer.audio_level(l));
                if let Err(err) = self.capture.start_capturing(level).await {
                    self.fail(err.into()).await;
                }
            }
            CaptureAction::Cancel => {
                self.capture_deferred = false;
                if let Err(err) = self.capture.cancel_capturing().await {
                    warn!("session: could not cancel capture: {err}");
                }
            }
        }
    }

    /// Cancel capture, unload playback, close the socket, go `Idle`.
    /// Safe to call in any state, any number of times.
    async fn teardown(&mut self, reason: VoiceEvent) {
        if let Err(err) = self.capture.cancel_capturing().await {
            warn!("session: could not cancel capture: {err}");
        }
        self.playback.stop();

        self.generation += 1;
        self.turn += 1;
        self.playbacks = 0;
        self.capture_deferred = false;
        self.connecting = false;
        self.awaiting_ready = false;
        self.inbound = None;
        self.deferred.clear();
        self.outbound.set(None);
        if let Some(connection) = self.connection.take() {
            connection.close();
        }

        self.apply(reason);
    }

    async fn fail(&mut self, err: SessionError) {
        self.report(&err);
        self.teardown(VoiceEvent::Fault).await;
    }

    fn report(&self, err: &SessionError) {
        error!("session: {err}");
        self.observer.error(err.kind(), &err.to_string());
    }
}

async fn recv_inbound(
    inbound: &mut Option<mpsc::UnboundedReceiver<InboundEvent>>,
) -> Option<InboundEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
