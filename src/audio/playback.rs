//! Response audio buffering and playback.
//!
//! Audio deltas for the current response turn are appended to a single
//! buffer.  When the turn completes, the buffer is normalised, wrapped in a
//! 24 kHz mono PCM16 container and handed to the [`AudioOutput`].  Turns
//! play one at a time, in the order they completed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use super::container::{self, CodecError, WIRE_BITS_PER_SAMPLE, WIRE_CHANNELS, WIRE_SAMPLE_RATE};
use super::device::{AudioOutput, PlaybackEnd};
use super::level::normalize_pcm;
use crate::config::PlaybackConfig;

#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("no output device available")]
    NoDevice,

    #[error("output device error: {0}")]
    Device(String),

    #[error("response audio unreadable: {0}")]
    Codec(#[from] CodecError),
}

/// Result of [`PlaybackPipeline::on_response_done`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackOutcome {
    /// The turn played to the end.
    Played { duration: Duration, gain: f32 },
    /// [`PlaybackPipeline::stop`] cut it short.
    Interrupted,
    /// No audio arrived for this turn.
    Empty,
}

/// Clears the playing flag when a play call ends, however it ends.
struct PlayingGuard<'a>(&'a AtomicBool);

impl Drop for PlayingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PlaybackPipeline {
    output: Arc<dyn AudioOutput>,
    config: PlaybackConfig,
    buffer: Mutex<Vec<u8>>,
    playing: AtomicBool,
    /// Held for the whole of one turn's playback.
    turn_lock: tokio::sync::Mutex<()>,
    /// Bumped by [`stop`](PlaybackPipeline::stop); turns queued under an
    /// older epoch are dropped.
    epoch: AtomicU64,
}

impl PlaybackPipeline {
    pub fn new(output: Arc<dyn AudioOutput>, config: PlaybackConfig) -> Self {
        Self {
            output,
            config,
            buffer: Mutex::new(Vec::new()),
            playing: AtomicBool::new(false),
            turn_lock: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Append one decoded audio delta to the turn buffer.
    pub fn on_audio_delta(&self, pcm: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(pcm);
    }

    /// Take everything buffered for the turn and return a future that
    /// plays it.
    ///
    /// The buffer is emptied before this returns, so deltas of a later
    /// response start a fresh turn.  The future waits for any earlier turn
    /// to finish playing; the playing flag is set while the output runs.
    pub fn on_response_done(
        self: &Arc<Self>,
    ) -> impl Future<Output = Result<PlaybackOutcome, PlaybackError>> + Send + 'static {
        let pcm = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|e| e.into_inner()));
        let epoch = self.epoch.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        async move { this.play_turn(pcm, epoch).await }
    }

    async fn play_turn(&self, pcm: Vec<u8>, epoch: u64) -> Result<PlaybackOutcome, PlaybackError> {
        if pcm.len() < 2 {
            debug!("playback: response carried no audio");
            return Ok(PlaybackOutcome::Empty);
        }

        let (normalized, gain) =
            normalize_pcm(&pcm, self.config.target_amplitude, self.config.gain_cap);
        let wrapped = container::wrap_pcm(
            &normalized,
            WIRE_SAMPLE_RATE,
            WIRE_CHANNELS,
            WIRE_BITS_PER_SAMPLE,
        )?;
        let (header, _) = container::unwrap(&wrapped)?;
        let duration = header.duration();

        let _turn = self.turn_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("playback: queued turn dropped by stop");
            return Ok(PlaybackOutcome::Interrupted);
        }

        self.playing.store(true, Ordering::SeqCst);
        let _guard = PlayingGuard(&self.playing);

        self.output.configure_for_playback().await?;
        info!("playback: {duration:?} of audio at gain {gain:.2}");
        match self.output.play(wrapped).await? {
            PlaybackEnd::Completed => Ok(PlaybackOutcome::Played { duration, gain }),
            PlaybackEnd::Interrupted => {
                debug!("playback: interrupted");
                Ok(PlaybackOutcome::Interrupted)
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Bytes currently waiting for the end of the turn.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop buffered audio without playing it.
    pub fn clear(&self) {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Unload the output, drop queued turns and buffered audio.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.output.stop();
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
