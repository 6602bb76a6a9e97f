//! Capability set consumed from the external media engine
//!
//! The engine owns media capture, codecs, ICE and the peer connection
//! itself. The call layer only hands it opaque descriptions and candidates
//! and reacts to the events it raises.

use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for media engine calls
pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Failure reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {reason}")]
pub struct MediaError {
    pub operation: &'static str,
    pub reason: String,
}

impl MediaError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// Which side of the exchange a local description is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionRole {
    Offer,
    Answer,
}

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events the engine raises towards the call layer
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Local candidate gathered; must be trickled to the peer
    LocalIceCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
    /// Remote media arrived (e.g. "audio", "video")
    RemoteTrack { kind: String },
}

/// Real-time media engine driven by a [`CallSession`](super::CallSession)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open camera/microphone; called once before the first connection
    async fn acquire_local_media(&self) -> MediaResult<()>;

    /// Create the peer connection object for `peer` with local tracks attached
    async fn create_connection(&self, peer: &str) -> MediaResult<()>;

    async fn create_local_description(
        &self,
        role: DescriptionRole,
    ) -> MediaResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()>;

    /// Close the connection object and release local media
    async fn close(&self) -> MediaResult<()>;
}
