//! Voice session: state machine, orchestrator and presentation callbacks.

pub mod observer;
pub mod runner;
pub mod state;

pub use observer::{ErrorKind, LogObserver, SessionObserver};
pub use runner::{SessionCommand, SessionDeps, SessionError, SessionHandle, VoiceSession};
pub use state::{CaptureAction, Transition, VoiceEvent, VoiceState, VoiceStateMachine};
