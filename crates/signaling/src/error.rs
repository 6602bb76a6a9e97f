//! Error types for the signaling relay

use crate::call::{CallError, MediaError};
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::registry::RegistryError;

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in relay, routing and call operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registration identifier failed validation
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Registration identifier already held by another endpoint
    #[error("Identifier already taken: {0}")]
    IdentifierTaken(String),

    /// Routed envelope names a target that is not registered
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Envelope could not be parsed or lacks required fields
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope type outside the protocol
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Call state machine refused an event
    #[error("Invalid call transition: {0}")]
    InvalidTransition(String),

    /// Endpoint is already in a call with another peer
    #[error("Endpoint busy: {0}")]
    Busy(String),

    /// Media engine reported an error
    #[error("Media engine error: {0}")]
    Media(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Outbound queue closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error comes from registration or routing
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidIdentifier(_)
                | Error::IdentifierTaken(_)
                | Error::UnknownTarget(_)
                | Error::MalformedEnvelope(_)
                | Error::UnknownMessageType(_)
        )
    }

    /// Check if this error comes from the call lifecycle
    pub fn is_call_error(&self) -> bool {
        matches!(self, Error::InvalidTransition(_) | Error::Busy(_))
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidIdentifier(reason) => Error::InvalidIdentifier(reason),
            RegistryError::IdentifierTaken(id) => Error::IdentifierTaken(id),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Malformed(reason) => Error::MalformedEnvelope(reason),
            ProtocolError::UnknownType(kind) => Error::UnknownMessageType(kind),
        }
    }
}

impl From<CallError> for Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Busy { .. } => Error::Busy(err.to_string()),
            CallError::InvalidTransition { .. } => Error::InvalidTransition(err.to_string()),
        }
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::IdentifierTaken("alice".to_string());
        assert_eq!(err.to_string(), "Identifier already taken: alice");
    }

    #[test]
    fn test_registry_error_conversion() {
        let err = Error::from(RegistryError::InvalidIdentifier("empty".to_string()));
        assert!(matches!(err, Error::InvalidIdentifier(_)));
        assert!(err.is_routing_error());
        assert!(!err.is_call_error());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err = Error::from(ProtocolError::UnknownType("ping".to_string()));
        assert!(matches!(err, Error::UnknownMessageType(ref t) if t == "ping"));
    }

    #[test]
    fn test_call_error_conversion() {
        let err = Error::from(CallError::Busy {
            current: "bob".to_string(),
            other: "carol".to_string(),
        });
        assert!(err.is_call_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port in use");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
