//! WebSocket transport for the signaling relay
//!
//! Text frames carry one JSON envelope each; binary frames are ignored.

mod events;
mod handler;
mod server;

pub use events::RelayEvent;
pub use handler::SharedState;
pub use server::{SignalingServer, SignalingServerHandle};
