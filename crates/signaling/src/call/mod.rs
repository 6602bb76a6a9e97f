//! Call lifecycle: state machine, media engine seam and the session driver

pub mod media;
pub mod session;
pub mod state;

pub use media::{
    DescriptionRole, MediaEngine, MediaError, MediaEvent, MediaResult, PeerConnectionState,
};
pub use session::{CallSession, CallSessionConfig};
pub use state::{CallError, CallEvent, CallState, CallStateMachine, Transition};
