//! Engine settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// TurnDetection
// ---------------------------------------------------------------------------

/// Who decides where a user turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDetection {
    /// Backend VAD commits the input buffer and replies.
    ServerVad,
    /// The client calls `end_turn()`.
    Manual,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self::ServerVad
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

/// Connection settings for the realtime speech backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Websocket endpoint (without the `model` query parameter).
    pub url: String,
    /// Model identifier appended as `?model=…`.
    pub model: String,
    /// Output voice requested in `session.update`.
    pub voice: String,
    /// Base system instructions; the per-session context is appended.
    pub instructions: String,
    /// Long-lived API key.  `None` falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Optional endpoint that mints short-lived client secrets.  When set,
    /// the API key is only sent there and the websocket uses the minted token.
    pub token_url: Option<String>,
    /// Input transcription model; `None` disables user transcripts.
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetection,
    /// Seconds allowed for the TCP/TLS/websocket upgrade.
    pub connect_timeout_secs: u64,
    /// Seconds allowed between transport open and `session.created`.
    pub handshake_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            instructions: "You are a calm, supportive voice companion. Keep replies short \
                           and conversational."
                .into(),
            api_key: None,
            token_url: None,
            transcription_model: Some("whisper-1".into()),
            turn_detection: TurnDetection::default(),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Full websocket URL including the model query parameter.
    pub fn endpoint(&self) -> String {
        if self.url.contains('?') {
            format!("{}&model={}", self.url, self.model)
        } else {
            format!("{}?model={}", self.url, self.model)
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Microphone capture and chunk rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interval between recorder rotations in milliseconds.
    pub rotation_interval_ms: u64,
    /// Bounded wait for the capture lock in `start_capturing`.
    pub start_lock_timeout_ms: u64,
    /// Bounded wait for the capture lock in `stop_capturing` / `cancel_capturing`.
    pub stop_lock_timeout_ms: u64,
    /// Input device name: `None` means the system default.
    pub input_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            rotation_interval_ms: 2_000,
            start_lock_timeout_ms: 2_000,
            stop_lock_timeout_ms: 3_000,
            input_device: None,
        }
    }
}

impl CaptureConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms.max(1))
    }

    pub fn start_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.start_lock_timeout_ms)
    }

    pub fn stop_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_lock_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

/// Speaker output and gain normalisation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Normalisation target as a fraction of 16-bit full scale (0.0 – 1.0).
    pub target_amplitude: f32,
    /// Upper bound on the normalisation gain.
    pub gain_cap: f32,
    /// Pause between the end of playback and re-opening the microphone.
    pub settle_delay_ms: u64,
    /// Output device name: `None` means the system default.
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            target_amplitude: 0.95,
            gain_cap: 3.0,
            settle_delay_ms: 800,
            output_device: None,
        }
    }
}

impl PlaybackConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Conversation-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Text turn sent once after the session is configured so the assistant
    /// speaks first.  `None` waits for the user.
    pub greeting: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: Some("Please greet me briefly and ask how I am feeling today.".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use voice_session::config::AppConfig;
///
/// let config = AppConfig::load().unwrap();
/// println!("{}", config.backend.endpoint());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns defaults when the file does not exist yet.  An empty
    /// `backend.api_key` is filled from `OPENAI_API_KEY`.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&AppPaths::new().settings_file)?;
        config.apply_env();
        Ok(config)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        let missing = self
            .backend
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty());
        if missing {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                if !key.trim().is_empty() {
                    self.backend.api_key = Some(key);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.backend.url, loaded.backend.url);
        assert_eq!(original.backend.model, loaded.backend.model);
        assert_eq!(original.backend.turn_detection, loaded.backend.turn_detection);
        assert_eq!(
            original.capture.rotation_interval_ms,
            loaded.capture.rotation_interval_ms
        );
        assert_eq!(original.playback.gain_cap, loaded.playback.gain_cap);
        assert_eq!(original.session.greeting, loaded.session.greeting);
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.capture.rotation_interval_ms, 2_000);
        assert!(config.backend.api_key.is_none());
    }

    #[test]
    fn default_timings() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.capture.rotation_interval(), Duration::from_millis(2_000));
        assert_eq!(cfg.capture.start_lock_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.capture.stop_lock_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.playback.settle_delay(), Duration::from_millis(800));
        assert!(cfg.playback.gain_cap > 1.0);
        assert!(cfg.playback.target_amplitude < 1.0);
    }

    #[test]
    fn endpoint_appends_model() {
        let mut backend = BackendConfig::default();
        backend.url = "wss://example.test/v1/realtime".into();
        backend.model = "m1".into();
        assert_eq!(backend.endpoint(), "wss://example.test/v1/realtime?model=m1");

        backend.url = "wss://example.test/rt?region=eu".into();
        assert_eq!(backend.endpoint(), "wss://example.test/rt?region=eu&model=m1");
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.backend.turn_detection = TurnDetection::Manual;
        cfg.backend.api_key = Some("sk-test".into());
        cfg.backend.token_url = Some("https://example.test/token".into());
        cfg.capture.input_device = Some("USB Mic".into());
        cfg.playback.settle_delay_ms = 250;
        cfg.session.greeting = None;

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.backend.turn_detection, TurnDetection::Manual);
        assert_eq!(loaded.backend.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            loaded.backend.token_url.as_deref(),
            Some("https://example.test/token")
        );
        assert_eq!(loaded.capture.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(loaded.playback.settle_delay_ms, 250);
        assert!(loaded.session.greeting.is_none());
    }
}
