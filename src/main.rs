//! Command-line voice session.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (defaults on first run).
//! 3. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Pick the token provider and build the websocket connector.
//! 5. Open the cpal input and output devices.
//! 6. Spawn the session task and start the conversation.
//! 7. Wait for Ctrl-C, then tear the session down.
//!
//! Any arguments are joined and appended to the session instructions:
//!
//! ```text
//! voice-session "The user is preparing for a job interview."
//! ```

use std::sync::Arc;

use anyhow::Context;
use voice_session::{
    audio::{CpalInput, CpalOutput},
    config::AppConfig,
    realtime::{provider_from_config, WebSocketConnector},
    session::{LogObserver, SessionDeps, VoiceSession},
};

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-session starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    let context = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let context = (!context.trim().is_empty()).then_some(context);

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run(config, context))
}

async fn run(config: AppConfig, context: Option<String>) -> anyhow::Result<()> {
    // 4. Backend
    let tokens = provider_from_config(&config.backend).context("no usable credentials")?;
    let connector = WebSocketConnector::new(config.backend.clone(), tokens);

    // 5. Devices
    let deps = SessionDeps {
        connector: Arc::new(connector),
        input: Arc::new(CpalInput::new(config.capture.input_device.clone())),
        output: Arc::new(CpalOutput::new(config.playback.output_device.clone())),
        observer: Arc::new(LogObserver),
    };

    // 6. Session
    let (session, handle) = VoiceSession::new(config, deps);
    let task = tokio::spawn(session.run());
    handle.start(context).await?;
    log::info!("Session started; press Ctrl-C to quit");

    // 7. Shutdown
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    handle.shutdown().await?;
    task.await.context("session task panicked")?;
    Ok(())
}
