//! Device audio seams: microphone recorders and speaker output.
//!
//! The capture and playback pipelines only talk to these traits.  The
//! production implementations live in [`crate::audio::cpal_io`]; the
//! `mock` module (tests only) provides instrumented doubles.

use std::sync::Arc;

use async_trait::async_trait;

use super::capture::CaptureError;
use super::playback::PlaybackError;

/// Receives the RMS level (`0.0..=1.0`) of every captured device buffer.
pub type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;

// ---------------------------------------------------------------------------
// Capture side
// ---------------------------------------------------------------------------

/// One open microphone recording.
///
/// A recorder holds the input device from the moment it is opened until
/// [`finish`](Recorder::finish) or [`discard`](Recorder::discard) returns.
#[async_trait]
pub trait Recorder: Send {
    /// Stop recording and return the finished buffer.  Usually a PCM16
    /// container in the device's native format; some backends return raw
    /// encoded audio instead.
    async fn finish(&mut self) -> Result<Vec<u8>, CaptureError>;

    /// Stop recording and drop whatever was captured.
    async fn discard(&mut self);
}

/// Factory for [`Recorder`]s plus the platform hooks that precede them.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Ask the platform for microphone access.
    async fn request_permission(&self) -> Result<(), CaptureError>;

    /// Put the audio subsystem into record-capable routing.
    async fn configure_for_capture(&self) -> Result<(), CaptureError>;

    /// Open a new recorder.  Level updates flow to `level` until it closes.
    async fn open_recorder(&self, level: LevelCallback) -> Result<Box<dyn Recorder>, CaptureError>;
}

// ---------------------------------------------------------------------------
// Playback side
// ---------------------------------------------------------------------------

/// How a call to [`AudioOutput::play`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Every sample was rendered.
    Completed,
    /// [`AudioOutput::stop`] unloaded the resource mid-playback.
    Interrupted,
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Switch the audio subsystem to speaker output routing.
    async fn configure_for_playback(&self) -> Result<(), PlaybackError>;

    /// Play a PCM16 container and resolve once playback has finished.
    async fn play(&self, container: Vec<u8>) -> Result<PlaybackEnd, PlaybackError>;

    /// Unload the current output resource.  An in-flight [`play`](Self::play)
    /// resolves with [`PlaybackEnd::Interrupted`].  No-op when idle.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::audio::container::{samples_to_pcm16, wrap_pcm};

    /// Counters shared between a [`MockInput`] and its recorders.
    #[derive(Default)]
    pub struct InputStats {
        pub opened: AtomicUsize,
        pub open_now: AtomicUsize,
        pub max_open: AtomicUsize,
        pub finished: AtomicUsize,
        pub discarded: AtomicUsize,
        /// Recorders opened while `speaker_busy` was set.
        pub opened_while_busy: AtomicUsize,
    }

    /// Instrumented microphone.  Every recorder yields a small 48 kHz stereo
    /// container (or raw bytes when `raw_output` is set).
    pub struct MockInput {
        pub stats: Arc<InputStats>,
        pub deny_permission: AtomicBool,
        pub fail_open: AtomicBool,
        pub raw_output: AtomicBool,
        /// Time spent inside `finish`, to widen race windows.
        pub finish_delay: Mutex<Duration>,
        pub speaker_busy: Arc<AtomicBool>,
    }

    impl MockInput {
        pub fn new() -> Self {
            Self {
                stats: Arc::new(InputStats::default()),
                deny_permission: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                raw_output: AtomicBool::new(false),
                finish_delay: Mutex::new(Duration::ZERO),
                speaker_busy: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn set_finish_delay(&self, delay: Duration) {
            *self.finish_delay.lock().unwrap() = delay;
        }
    }

    #[async_trait]
    impl AudioInput for MockInput {
        async fn request_permission(&self) -> Result<(), CaptureError> {
            if self.deny_permission.load(Ordering::SeqCst) {
                Err(CaptureError::PermissionDenied)
            } else {
                Ok(())
            }
        }

        async fn configure_for_capture(&self) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn open_recorder(
            &self,
            level: LevelCallback,
        ) -> Result<Box<dyn Recorder>, CaptureError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(CaptureError::ResourceExhausted("mock recorder pool".into()));
            }
            let stats = &self.stats;
            stats.opened.fetch_add(1, Ordering::SeqCst);
            let now = stats.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_open.fetch_max(now, Ordering::SeqCst);
            if self.speaker_busy.load(Ordering::SeqCst) {
                stats.opened_while_busy.fetch_add(1, Ordering::SeqCst);
            }
            level(0.25);
            Ok(Box::new(MockRecorder {
                stats: Arc::clone(&self.stats),
                delay: *self.finish_delay.lock().unwrap(),
                raw: self.raw_output.load(Ordering::SeqCst),
                closed: false,
            }))
        }
    }

    pub struct MockRecorder {
        stats: Arc<InputStats>,
        delay: Duration,
        raw: bool,
        closed: bool,
    }

    impl MockRecorder {
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.stats.open_now.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// 10 ms of 48 kHz stereo audio at a constant level.
    pub fn sample_container() -> Vec<u8> {
        wrap_pcm(&samples_to_pcm16(&[1_000_i16; 960]), 48_000, 2, 16).unwrap()
    }

    pub const RAW_BYTES: &[u8] = &[0x1A, 0x45, 0xDF, 0xA3, 0x42, 0x86];

    #[async_trait]
    impl Recorder for MockRecorder {
        async fn finish(&mut self) -> Result<Vec<u8>, CaptureError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.close();
            self.stats.finished.fetch_add(1, Ordering::SeqCst);
            if self.raw {
                Ok(RAW_BYTES.to_vec())
            } else {
                Ok(sample_container())
            }
        }

        async fn discard(&mut self) {
            self.close();
            self.stats.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for MockRecorder {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Speaker double.  Playback takes `play_duration` unless stopped.
    pub struct MockOutput {
        pub played: Mutex<Vec<Vec<u8>>>,
        pub play_duration: Mutex<Duration>,
        pub fail_play: AtomicBool,
        pub stops: AtomicUsize,
        stop_signal: Notify,
    }

    impl MockOutput {
        pub fn new(play_duration: Duration) -> Self {
            Self {
                played: Mutex::new(Vec::new()),
                play_duration: Mutex::new(play_duration),
                fail_play: AtomicBool::new(false),
                stops: AtomicUsize::new(0),
                stop_signal: Notify::new(),
            }
        }

        pub fn played_count(&self) -> usize {
            self.played.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AudioOutput for MockOutput {
        async fn configure_for_playback(&self) -> Result<(), PlaybackError> {
            Ok(())
        }

        async fn play(&self, container: Vec<u8>) -> Result<PlaybackEnd, PlaybackError> {
            if self.fail_play.load(Ordering::SeqCst) {
                return Err(PlaybackError::Device("mock output failure".into()));
            }
            self.played.lock().unwrap().push(container);
            let duration = *self.play_duration.lock().unwrap();
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(PlaybackEnd::Completed),
                _ = self.stop_signal.notified() => Ok(PlaybackEnd::Interrupted),
            }
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stop_signal.notify_waiters();
        }
    }
}
