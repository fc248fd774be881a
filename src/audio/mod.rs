//! Audio side of a voice session: microphone capture to wire PCM, and
//! response PCM to the speaker.
//!
//! Devices sit behind the [`AudioInput`] / [`AudioOutput`] traits; the cpal
//! backend lives in [`cpal_io`].

pub mod capture;
pub mod container;
pub mod cpal_io;
pub mod device;
pub mod level;
pub mod playback;
pub mod resample;

pub use capture::{AudioChunk, CaptureError, CaptureGate, CapturePipeline, ChunkSink, FinalChunk};
pub use container::{CodecError, ContainerHeader, ExtractedAudio};
pub use cpal_io::{CpalInput, CpalOutput};
pub use device::{AudioInput, AudioOutput, LevelCallback, PlaybackEnd, Recorder};
pub use playback::{PlaybackError, PlaybackOutcome, PlaybackPipeline};
