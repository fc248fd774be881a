//! Configuration module.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for the backend,
//! capture, playback and session layers, `AppPaths` for cross-platform
//! directories, and TOML persistence via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, BackendConfig, CaptureConfig, PlaybackConfig, SessionConfig, TurnDetection,
};
