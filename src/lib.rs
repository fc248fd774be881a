//! Real-time duplex voice sessions against a realtime speech backend.
//!
//! Microphone audio is recorded in short rotated chunks, normalised to
//! 24 kHz mono PCM16 and streamed over a websocket; response audio is
//! buffered per turn, loudness-normalised and played back.  A four-state
//! machine (`Idle`, `Listening`, `Processing`, `Speaking`) keeps capture and
//! playback from overlapping.
//!
//! Entry point: [`session::VoiceSession`].

pub mod audio;
pub mod config;
pub mod realtime;
pub mod session;
