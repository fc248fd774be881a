//! Voice state machine.
//!
//! [`VoiceStateMachine`] is pure: it maps `(state, event)` to the next state
//! and tells the caller what to do with the microphone.  The session runner
//! performs the side effects.
//!
//! ```text
//! Idle ──SessionStarted──▶ Processing ──PeerReady──▶ Listening
//!                              ▲                       │  │
//!                              └───────TurnEnded───────┘  │
//!                                                          │ ResponseStarted
//! Processing ──ResponseStarted──▶ Speaking ◀───────────────┘
//! Speaking ──PlaybackSettled──▶ Listening
//!
//! any ──Mute / Stop / Fault──▶ Idle   (Stop clears the mute flag, Fault keeps it)
//! Idle (muted) ──Unmute──▶ Listening   (connected)
//!                      └─▶ Processing  (socket was torn down; reconnect)
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// VoiceState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// No capture, no playback.  Initial state.
    #[default]
    Idle,
    /// Microphone open, audio streaming to the backend.
    Listening,
    /// Waiting on the backend: handshake, or a committed turn.
    Processing,
    /// Response audio is arriving and/or playing.
    Speaking,
}

impl VoiceState {
    pub fn label(&self) -> &'static str {
        match self {
            VoiceState::Idle => "Idle",
            VoiceState::Listening => "Listening",
            VoiceState::Processing => "Processing",
            VoiceState::Speaking => "Speaking",
        }
    }

    /// `true` in every state but `Idle`.
    pub fn is_active(&self) -> bool {
        !matches!(self, VoiceState::Idle)
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Events and transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    SessionStarted,
    /// The peer confirmed the configured session.
    PeerReady,
    /// The user's turn was committed.
    TurnEnded,
    /// `response.created` arrived.
    ResponseStarted,
    /// The response finished playing and the settle delay elapsed.
    PlaybackSettled,
    Mute,
    Unmute { connected: bool },
    Stop,
    Fault,
}

/// What the runner must do with the microphone after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureAction {
    None,
    Start,
    /// Stop immediately and discard the partial recording.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: VoiceState,
    pub to: VoiceState,
    pub capture: CaptureAction,
}

// ---------------------------------------------------------------------------
// VoiceStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VoiceStateMachine {
    state: VoiceState,
    muted: bool,
}

impl VoiceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Apply `event`.  Returns `None` when the event does not apply in the
    /// current state and nothing changed.
    pub fn apply(&mut self, event: VoiceEvent) -> Option<Transition> {
        use CaptureAction as C;
        use VoiceState as S;

        let (to, capture) = match (self.state, event) {
            (S::Idle, VoiceEvent::SessionStarted) => {
                self.muted = false;
                (S::Processing, C::None)
            }
            (S::Processing, VoiceEvent::PeerReady) if !self.muted => (S::Listening, C::Start),
            (S::Listening, VoiceEvent::TurnEnded) => (S::Processing, C::None),
            (S::Listening | S::Processing, VoiceEvent::ResponseStarted) => (S::Speaking, C::Cancel),
            (S::Speaking, VoiceEvent::PlaybackSettled) => (S::Listening, C::Start),

            (_, VoiceEvent::Mute) if !self.muted => {
                self.muted = true;
                (S::Idle, C::Cancel)
            }
            (S::Idle, VoiceEvent::Unmute { connected }) if self.muted => {
                self.muted = false;
                if connected {
                    (S::Listening, C::Start)
                } else {
                    (S::Processing, C::None)
                }
            }
            (from, VoiceEvent::Stop) if from != S::Idle || self.muted => {
                self.muted = false;
                (S::Idle, C::Cancel)
            }
            // A fault keeps the mute flag so that unmuting reconnects.
            (from, VoiceEvent::Fault) if from != S::Idle => (S::Idle, C::Cancel),
            _ => return None,
        };

        let transition = Transition {
            from: self.state,
            to,
            capture,
        };
        self.state = to;
        Some(transition)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(events: &[VoiceEvent]) -> VoiceStateMachine {
        let mut m = VoiceStateMachine::new();
        for &e in events {
            m.apply(e).expect("setup transition");
        }
        m
    }

    #[test]
    fn initial_state_is_idle() {
        let m = VoiceStateMachine::new();
        assert_eq!(m.state(), VoiceState::Idle);
        assert!(!m.is_muted());
        assert!(!m.state().is_active());
    }

    #[test]
    fn happy_path_turn() {
        let mut m = VoiceStateMachine::new();
        let t = m.apply(VoiceEvent::SessionStarted).unwrap();
        assert_eq!((t.from, t.to), (VoiceState::Idle, VoiceState::Processing));

        let t = m.apply(VoiceEvent::PeerReady).unwrap();
        assert_eq!(t.to, VoiceState::Listening);
        assert_eq!(t.capture, CaptureAction::Start);

        let t = m.apply(VoiceEvent::ResponseStarted).unwrap();
        assert_eq!(t.to, VoiceState::Speaking);
        assert_eq!(t.capture, CaptureAction::Cancel);

        let t = m.apply(VoiceEvent::PlaybackSettled).unwrap();
        assert_eq!(t.to, VoiceState::Listening);
        assert_eq!(t.capture, CaptureAction::Start);
    }

    #[test]
    fn response_started_from_listening_yields_speaking_once() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::PeerReady]);
        assert_eq!(
            m.apply(VoiceEvent::ResponseStarted).map(|t| t.to),
            Some(VoiceState::Speaking)
        );
        assert_eq!(m.apply(VoiceEvent::ResponseStarted), None);
        assert_eq!(m.state(), VoiceState::Speaking);
    }

    #[test]
    fn committed_turn_waits_in_processing() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::PeerReady]);
        assert_eq!(
            m.apply(VoiceEvent::TurnEnded).map(|t| t.to),
            Some(VoiceState::Processing)
        );
        assert_eq!(
            m.apply(VoiceEvent::ResponseStarted).map(|t| t.to),
            Some(VoiceState::Speaking)
        );
    }

    #[test]
    fn mute_cancels_and_unmute_resumes() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::PeerReady]);
        let t = m.apply(VoiceEvent::Mute).unwrap();
        assert_eq!(t.to, VoiceState::Idle);
        assert_eq!(t.capture, CaptureAction::Cancel);
        assert!(m.is_muted());

        assert_eq!(m.apply(VoiceEvent::Mute), None);
        assert_eq!(m.apply(VoiceEvent::PlaybackSettled), None);

        let t = m.apply(VoiceEvent::Unmute { connected: true }).unwrap();
        assert_eq!(t.to, VoiceState::Listening);
        assert_eq!(t.capture, CaptureAction::Start);
        assert!(!m.is_muted());
    }

    #[test]
    fn unmute_without_socket_reconnects() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::Mute]);
        let t = m.apply(VoiceEvent::Unmute { connected: false }).unwrap();
        assert_eq!(t.to, VoiceState::Processing);
        assert_eq!(t.capture, CaptureAction::None);
        assert!(m.apply(VoiceEvent::PeerReady).is_some());
    }

    #[test]
    fn unmute_when_not_muted_is_ignored() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::PeerReady]);
        assert_eq!(m.apply(VoiceEvent::Unmute { connected: true }), None);
    }

    #[test]
    fn stop_from_any_state_goes_idle() {
        for setup in [
            vec![VoiceEvent::SessionStarted],
            vec![VoiceEvent::SessionStarted, VoiceEvent::PeerReady],
            vec![
                VoiceEvent::SessionStarted,
                VoiceEvent::PeerReady,
                VoiceEvent::ResponseStarted,
            ],
            vec![VoiceEvent::SessionStarted, VoiceEvent::Mute],
        ] {
            let mut m = machine_in(&setup);
            let t = m.apply(VoiceEvent::Stop).unwrap();
            assert_eq!(t.to, VoiceState::Idle);
            assert_eq!(t.capture, CaptureAction::Cancel);
            assert!(!m.is_muted());
            assert_eq!(m.apply(VoiceEvent::Stop), None);
            assert_eq!(m.apply(VoiceEvent::Fault), None);
        }
    }

    #[test]
    fn fault_while_muted_keeps_mute() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::Mute]);
        assert_eq!(m.apply(VoiceEvent::Fault), None);
        assert!(m.is_muted());
        let t = m.apply(VoiceEvent::Unmute { connected: false }).unwrap();
        assert_eq!(t.to, VoiceState::Processing);
    }

    #[test]
    fn fault_goes_idle() {
        let mut m = machine_in(&[VoiceEvent::SessionStarted, VoiceEvent::PeerReady]);
        let t = m.apply(VoiceEvent::Fault).unwrap();
        assert_eq!(t.to, VoiceState::Idle);
        assert_eq!(t.capture, CaptureAction::Cancel);
        assert!(!m.is_muted());
    }

    #[test]
    fn events_out_of_order_are_ignored() {
        let mut m = VoiceStateMachine::new();
        assert_eq!(m.apply(VoiceEvent::PeerReady), None);
        assert_eq!(m.apply(VoiceEvent::ResponseStarted), None);
        assert_eq!(m.apply(VoiceEvent::TurnEnded), None);
        assert_eq!(m.state(), VoiceState::Idle);
    }

    #[test]
    fn labels() {
        assert_eq!(VoiceState::Speaking.to_string(), "Speaking");
        assert_eq!(VoiceState::default(), VoiceState::Idle);
    }
}
