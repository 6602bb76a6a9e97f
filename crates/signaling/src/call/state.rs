//! Call lifecycle state machine
//!
//! One machine tracks one endpoint's view of a call:
//!
//! ```text
//! Idle --Dial--> Calling --answer/offer received--> Negotiating --media connected--> Connected
//! Idle --IncomingCall--> Ringing --accept/offer--> Negotiating
//! Calling/Ringing/Negotiating/Connected --hangup/disconnected/failed--> Ended
//! ```
//!
//! `Ended` is terminal for a call instance; dialing or ringing again from
//! `Ended` starts a new instance with a fresh call id.

use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Phase of a call from one endpoint's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// Outgoing call placed, waiting for the description exchange
    Calling,
    /// Incoming call not yet accepted
    Ringing,
    /// Descriptions being exchanged
    Negotiating,
    /// Media engine reports the peer connection as connected
    Connected,
    /// Call over
    Ended,
}

impl CallState {
    /// A call instance is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Negotiating | CallState::Connected
        )
    }

    /// Waiting for the other side to pick up
    pub fn is_setup_phase(&self) -> bool {
        matches!(self, CallState::Calling | CallState::Ringing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Local side places a call to the peer
    Dial(String),
    /// Peer is calling us
    IncomingCall(String),
    /// Local user accepts a ringing call
    Accept,
    OfferSent(String),
    OfferReceived(String),
    AnswerSent(String),
    AnswerReceived(String),
    /// Candidate exchanged with the peer, in either direction
    IceCandidate(String),
    MediaConnected,
    MediaDisconnected,
    MediaFailed,
    /// Local hangup, or hangup received from the current peer
    Hangup,
    /// Call setup took too long
    SetupTimeout,
}

impl CallEvent {
    /// Peer named by a signaling event
    pub fn peer(&self) -> Option<&str> {
        match self {
            CallEvent::Dial(p)
            | CallEvent::IncomingCall(p)
            | CallEvent::OfferSent(p)
            | CallEvent::OfferReceived(p)
            | CallEvent::AnswerSent(p)
            | CallEvent::AnswerReceived(p)
            | CallEvent::IceCandidate(p) => Some(p),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Dial(_) => "dial",
            CallEvent::IncomingCall(_) => "incoming-call",
            CallEvent::Accept => "accept",
            CallEvent::OfferSent(_) => "offer-sent",
            CallEvent::OfferReceived(_) => "offer-received",
            CallEvent::AnswerSent(_) => "answer-sent",
            CallEvent::AnswerReceived(_) => "answer-received",
            CallEvent::IceCandidate(_) => "ice-candidate",
            CallEvent::MediaConnected => "media-connected",
            CallEvent::MediaDisconnected => "media-disconnected",
            CallEvent::MediaFailed => "media-failed",
            CallEvent::Hangup => "hangup",
            CallEvent::SetupTimeout => "setup-timeout",
        }
    }
}

/// Event refused by the state machine; the state is left unchanged
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("{event} not allowed while {state}")]
    InvalidTransition {
        state: CallState,
        event: &'static str,
    },

    #[error("in a call with {current}, refusing {other}")]
    Busy { current: String, other: String },
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// This event ended the call
    pub fn ended(&self) -> bool {
        self.changed() && self.to == CallState::Ended
    }
}

/// Explicit call lifecycle for one endpoint
#[derive(Debug, Clone, Default)]
pub struct CallStateMachine {
    state: CallState,
    peer: Option<String>,
    call_id: u64,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Other party of the current or most recent call
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Number of call instances started so far
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_setup_phase(&self) -> bool {
        self.state.is_setup_phase()
    }

    /// Apply one event
    pub fn apply(&mut self, event: CallEvent) -> Result<Transition, CallError> {
        use CallEvent as E;
        use CallState as S;

        let from = self.state;

        if let (Some(other), Some(current)) = (event.peer(), self.peer.as_deref()) {
            if from.is_active() && other != current {
                return Err(CallError::Busy {
                    current: current.to_string(),
                    other: other.to_string(),
                });
            }
        }

        let to = match (from, &event) {
            (S::Idle | S::Ended, E::Dial(peer)) => {
                self.begin(peer);
                S::Calling
            }
            (S::Idle | S::Ended, E::IncomingCall(peer)) => {
                self.begin(peer);
                S::Ringing
            }
            (S::Calling, E::Dial(_)) => S::Calling,
            (S::Ringing, E::IncomingCall(_)) => S::Ringing,

            (S::Ringing, E::Accept) => S::Negotiating,
            (S::Ringing, E::OfferReceived(_) | E::OfferSent(_) | E::AnswerSent(_)) => {
                S::Negotiating
            }
            (S::Calling, E::AnswerReceived(_) | E::OfferReceived(_)) => S::Negotiating,
            (S::Calling, E::OfferSent(_)) => S::Calling,
            (
                S::Negotiating | S::Connected,
                E::OfferSent(_) | E::OfferReceived(_) | E::AnswerSent(_) | E::AnswerReceived(_),
            ) => from,

            (S::Calling | S::Ringing | S::Negotiating | S::Connected, E::IceCandidate(_)) => from,

            (S::Negotiating | S::Connected, E::MediaConnected) => S::Connected,

            (S::Calling | S::Ringing, E::SetupTimeout) => S::Ended,
            (_, E::SetupTimeout) => from,

            (
                S::Calling | S::Ringing | S::Negotiating | S::Connected,
                E::MediaDisconnected | E::MediaFailed | E::Hangup,
            ) => S::Ended,
            (S::Idle | S::Ended, E::MediaDisconnected | E::MediaFailed | E::Hangup) => from,

            _ => {
                return Err(CallError::InvalidTransition {
                    state: from,
                    event: event.name(),
                })
            }
        };

        self.state = to;
        let transition = Transition { from, to };
        if transition.changed() {
            debug!(
                "Call {} with {:?}: {} -> {} on {}",
                self.call_id,
                self.peer,
                from,
                to,
                event.name()
            );
        }
        Ok(transition)
    }

    fn begin(&mut self, peer: &str) {
        self.peer = Some(peer.to_string());
        self.call_id += 1;
    }
}
