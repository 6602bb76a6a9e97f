//! PeerCall signaling relay
//!
//! A WebSocket relay that lets two browser endpoints find each other by a
//! chosen identifier and exchange the session descriptions and ICE
//! candidates needed to set up a direct media call, plus the call state
//! machine that drives one endpoint's side of that exchange.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Endpoint (browser or native)                          │
//! │  ├─ CallSession (state machine + MediaEngine)          │
//! │  └─ SignalingClient                                    │
//! │     ↓ (JSON envelopes over WebSocket)                  │
//! │  SignalingServer                                       │
//! │  ├─ handler (one task per connection)                  │
//! │  └─ Router                                             │
//! │     └─ Registry (identifier → endpoint, call record)   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peercall_signaling::protocol::Envelope;
//!
//! let envelope = Envelope::parse(r#"{"type":"call","target":"bob"}"#).unwrap();
//! assert_eq!(envelope.kind(), "call");
//! assert_eq!(envelope.target(), Some("bob"));
//! ```
//!
//! ## Running a relay
//!
//! ```no_run
//! use peercall_signaling::{RelayConfig, SignalingServer};
//!
//! # async fn example() -> peercall_signaling::Result<()> {
//! let handle = SignalingServer::bind(RelayConfig::default()).await?;
//! println!("listening on {}", handle.url());
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod websocket;

pub use call::{CallSession, CallSessionConfig, CallState, CallStateMachine, MediaEngine};
pub use client::SignalingClient;
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use protocol::Envelope;
pub use registry::{ConflictPolicy, Registry};
pub use router::{Router, RoutingOutcome};
pub use websocket::{RelayEvent, SignalingServer, SignalingServerHandle};
