//! Microphone capture with periodic recorder rotation.
//!
//! [`CapturePipeline`] turns a device [`Recorder`] into a stream of wire-ready
//! PCM chunks.  Every `rotation_interval` the current recorder is finished,
//! its buffer converted to 24 kHz mono PCM16 and handed to a [`ChunkSink`],
//! and a fresh recorder is opened if the [`CaptureGate`] still allows it.
//!
//! All recorder transitions (open, rotate, stop, cancel) run under one async
//! mutex, acquired with a bounded wait.  At most one recorder is ever open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use super::container::{self, CodecError, ExtractedAudio};
use super::device::{AudioInput, LevelCallback, Recorder};
use crate::config::CaptureConfig;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("capture is busy: lock not acquired within {0:?}")]
    Busy(Duration),

    #[error("no input device available")]
    NoDevice,

    #[error("input device error: {0}")]
    Device(String),

    #[error("audio resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("recorded audio unreadable: {0}")]
    Codec(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// Chunks, sink and gate
// ---------------------------------------------------------------------------

/// One finished recorder buffer, before conversion.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    /// Monotonic per-pipeline sequence number.
    pub sequence: u64,
    /// When the recorder that produced this chunk was opened.
    pub captured_at: Instant,
}

/// Summary of the final chunk forwarded by [`CapturePipeline::stop_capturing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalChunk {
    pub sequence: u64,
    /// Bytes handed to the sink (0 when the chunk was empty or unreadable).
    pub bytes_sent: usize,
}

/// Destination for converted audio.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Forward one chunk of wire PCM (or an opaque raw buffer).
    async fn send_audio(&self, pcm: Vec<u8>);

    /// Signal the end of a user turn.
    async fn commit_turn(&self);
}

/// Session-side checks consulted by the rotation loop.
pub trait CaptureGate: Send + Sync {
    /// Whether a new recorder may be opened right now.  Must be false while
    /// response audio is playing.
    fn may_record(&self) -> bool;

    /// A rotation failed in the background; capture has stopped.
    fn capture_failed(&self, err: CaptureError);
}

// ---------------------------------------------------------------------------
// CapturePipeline
// ---------------------------------------------------------------------------

struct ActiveRecorder {
    recorder: Box<dyn Recorder>,
    opened_at: Instant,
}

#[derive(Default)]
struct CaptureInner {
    recorder: Option<ActiveRecorder>,
    rotation: Option<JoinHandle<()>>,
    level: Option<LevelCallback>,
    last_rotation: Option<Instant>,
    next_sequence: u64,
}

impl CaptureInner {
    fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

struct CaptureShared {
    input: Arc<dyn AudioInput>,
    sink: Arc<dyn ChunkSink>,
    gate: Arc<dyn CaptureGate>,
    config: CaptureConfig,
    capturing: AtomicBool,
    inner: Mutex<CaptureInner>,
}

/// Cheaply cloneable handle to the capture state.
#[derive(Clone)]
pub struct CapturePipeline {
    shared: Arc<CaptureShared>,
}

impl CapturePipeline {
    pub fn new(
        input: Arc<dyn AudioInput>,
        sink: Arc<dyn ChunkSink>,
        gate: Arc<dyn CaptureGate>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            shared: Arc::new(CaptureShared {
                input,
                sink,
                gate,
                config,
                capturing: AtomicBool::new(false),
                inner: Mutex::new(CaptureInner::default()),
            }),
        }
    }

    /// Open a recorder and start the rotation timer.
    ///
    /// A no-op while capture is already running.  A stale recorder left from
    /// an earlier failure is discarded first.
    ///
    /// # Errors
    ///
    /// [`CaptureError::Busy`] when the lock is not acquired within the start
    /// timeout, or the permission / device error that stopped the recorder
    /// from opening.
    pub async fn start_capturing(&self, level: LevelCallback) -> Result<(), CaptureError> {
        let wait = self.shared.config.start_lock_timeout();
        let mut inner = self.shared.lock(wait).await?;

        if self.shared.capturing.load(Ordering::SeqCst) && inner.recorder.is_some() {
            debug!("capture: already capturing, start ignored");
            return Ok(());
        }

        if let Some(handle) = inner.rotation.take() {
            handle.abort();
        }
        if let Some(mut stale) = inner.recorder.take() {
            warn!("capture: discarding stale recorder before start");
            stale.recorder.discard().await;
        }

        self.shared.input.request_permission().await?;
        self.shared.input.configure_for_capture().await?;
        let recorder = self.shared.input.open_recorder(Arc::clone(&level)).await?;

        let now = Instant::now();
        inner.recorder = Some(ActiveRecorder {
            recorder,
            opened_at: now,
        });
        inner.level = Some(level);
        inner.last_rotation = Some(now);
        self.shared.capturing.store(true, Ordering::SeqCst);
        inner.rotation = Some(self.spawn_rotation());

        info!("capture: started");
        Ok(())
    }

    /// Stop capture, forward the final chunk and commit the turn.
    ///
    /// Returns `Ok(None)` when no recorder was open.  The turn is still
    /// committed if capture was running (e.g. a rotation was mid-reopen).
    pub async fn stop_capturing(&self) -> Result<Option<FinalChunk>, CaptureError> {
        let wait = self.shared.config.stop_lock_timeout();
        let mut inner = self.shared.lock(wait).await?;

        let was_capturing = self.shared.capturing.swap(false, Ordering::SeqCst);
        if let Some(handle) = inner.rotation.take() {
            handle.abort();
        }

        let Some(mut active) = inner.recorder.take() else {
            if was_capturing {
                self.shared.sink.commit_turn().await;
            }
            debug!("capture: stop with no open recorder");
            return Ok(None);
        };

        let bytes = active.recorder.finish().await?;
        let sequence = inner.take_sequence();
        let bytes_sent = self
            .shared
            .forward(AudioChunk {
                bytes,
                sequence,
                captured_at: active.opened_at,
            })
            .await;
        self.shared.sink.commit_turn().await;

        info!("capture: stopped, final chunk #{sequence} ({bytes_sent} bytes)");
        Ok(Some(FinalChunk {
            sequence,
            bytes_sent,
        }))
    }

    /// Stop capture and throw the last recording away.  Nothing is sent and
    /// the turn is not committed.
    pub async fn cancel_capturing(&self) -> Result<(), CaptureError> {
        let wait = self.shared.config.stop_lock_timeout();
        let mut inner = self.shared.lock(wait).await?;

        self.shared.capturing.store(false, Ordering::SeqCst);
        if let Some(handle) = inner.rotation.take() {
            handle.abort();
        }
        if let Some(mut active) = inner.recorder.take() {
            active.recorder.discard().await;
            debug!("capture: cancelled, recording discarded");
        }
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    /// Time of the last rotation, or `None` while the lock is held.
    pub fn last_rotation(&self) -> Option<Instant> {
        self.shared
            .inner
            .try_lock()
            .ok()
            .and_then(|inner| inner.last_rotation)
    }

    fn spawn_rotation(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let period = shared.config.rotation_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !shared.capturing.load(Ordering::SeqCst) {
                    break;
                }
                shared.rotate().await;
            }
        })
    }
}

impl CaptureShared {
    async fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, CaptureInner>, CaptureError> {
        timeout(wait, self.inner.lock())
            .await
            .map_err(|_| CaptureError::Busy(wait))
    }

    /// One rotation tick: finish, forward, maybe reopen.
    async fn rotate(&self) {
        let mut inner = match self.lock(self.config.start_lock_timeout()).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("capture: rotation skipped: {e}");
                return;
            }
        };
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }

        if let Some(mut active) = inner.recorder.take() {
            match active.recorder.finish().await {
                Ok(bytes) => {
                    let sequence = inner.take_sequence();
                    self.forward(AudioChunk {
                        bytes,
                        sequence,
                        captured_at: active.opened_at,
                    })
                    .await;
                }
                Err(e) => {
                    error!("capture: recorder failed during rotation: {e}");
                    self.capturing.store(false, Ordering::SeqCst);
                    self.gate.capture_failed(e);
                    return;
                }
            }
        }
        inner.last_rotation = Some(Instant::now());

        if !self.gate.may_record() {
            debug!("capture: reopen deferred, not listening");
            return;
        }
        let Some(level) = inner.level.clone() else {
            return;
        };
        match self.input.open_recorder(level).await {
            Ok(recorder) => {
                inner.recorder = Some(ActiveRecorder {
                    recorder,
                    opened_at: Instant::now(),
                });
            }
            Err(e) => {
                error!("capture: could not reopen recorder: {e}");
                self.capturing.store(false, Ordering::SeqCst);
                self.gate.capture_failed(e);
            }
        }
    }

    /// Convert and send one chunk.  Returns the number of bytes sent.
    /// Unreadable chunks are logged and skipped.
    async fn forward(&self, chunk: AudioChunk) -> usize {
        let pcm = match container::extract(chunk.bytes) {
            Ok(ExtractedAudio::Container { header, payload }) => {
                match container::to_wire_pcm(&header, &payload) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        warn!("capture: chunk #{} skipped: {e}", chunk.sequence);
                        return 0;
                    }
                }
            }
            Ok(ExtractedAudio::Raw(bytes)) => {
                warn!(
                    "capture: chunk #{} is not a PCM container, forwarding {} raw bytes",
                    chunk.sequence,
                    bytes.len()
                );
                bytes
            }
            Err(e) => {
                warn!("capture: chunk #{} skipped: {e}", chunk.sequence);
                return 0;
            }
        };

        if pcm.is_empty() {
            return 0;
        }
        debug!(
            "capture: chunk #{} ({} bytes, {:?} old)",
            chunk.sequence,
            pcm.len(),
            chunk.captured_at.elapsed()
        );
        let len = pcm.len();
        self.sink.send_audio(pcm).await;
        len
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
