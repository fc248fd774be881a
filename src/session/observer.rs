//! Callbacks from the session to the presentation layer.

use std::fmt;

use log::{error, info, trace};

use super::state::VoiceState;
use crate::realtime::TranscriptSource;

/// Category of a surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Permission,
    Capture,
    Playback,
    Peer,
    Auth,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Permission => "permission",
            ErrorKind::Capture => "capture",
            ErrorKind::Playback => "playback",
            ErrorKind::Peer => "backend",
            ErrorKind::Auth => "auth",
        };
        f.write_str(label)
    }
}

/// Receives everything the user should see or hear about.
///
/// Called from the session task; implementations should return quickly.
/// `audio_level` is called from the capture thread.
pub trait SessionObserver: Send + Sync {
    fn transcript(&self, source: TranscriptSource, text: &str);

    /// Microphone level in `0.0..=1.0`.
    fn audio_level(&self, level: f32);

    fn error(&self, kind: ErrorKind, message: &str);

    fn state_changed(&self, state: VoiceState);

    /// Server-side VAD heard the user start (`true`) or stop talking.
    fn speech_activity(&self, _speaking: bool) {}
}

/// Writes everything to the log.  Used by the CLI.
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn transcript(&self, source: TranscriptSource, text: &str) {
        match source {
            TranscriptSource::User => info!("you: {text}"),
            TranscriptSource::Assistant => trace!("assistant: {text}"),
        }
    }

    fn audio_level(&self, level: f32) {
        trace!("level {level:.3}");
    }

    fn error(&self, kind: ErrorKind, message: &str) {
        error!("{kind} error: {message}");
    }

    fn state_changed(&self, state: VoiceState) {
        info!("state: {state}");
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
