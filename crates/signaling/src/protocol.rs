//! Signaling envelope protocol
//!
//! Every message on the wire is a UTF-8 JSON object tagged by its `type`
//! field. Clients address directed messages with `target`; the relay strips
//! `target` and writes `from` with the sender's registered identifier before
//! delivery, so a client-supplied `from` never reaches another peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire names of every envelope type the relay understands
pub const KNOWN_TYPES: &[&str] = &[
    "register",
    "registered",
    "call",
    "incoming-call",
    "offer",
    "answer",
    "ice-candidate",
    "hangup",
    "target-unavailable",
    "registration-replaced",
];

/// Opaque session description produced by the media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

/// Opaque ICE candidate produced by the media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub Value);

/// Why a directed envelope could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnavailableReason {
    /// No endpoint holds the target identifier
    NotRegistered,
    /// Target is in a call with another peer
    Busy,
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Client asks to be known under `id`
    Register { id: String },

    /// Relay confirms a registration
    Registered { id: String },

    /// Client asks the relay to ring `target`
    Call { target: String },

    /// Relay tells the callee who is calling
    IncomingCall { from: String },

    /// Session description offer
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        data: SessionDescription,
    },

    /// Session description answer
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        data: SessionDescription,
    },

    /// Trickled ICE candidate
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        data: IceCandidate,
    },

    /// Either party ends the call
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Relay reports that a `call` or `offer` was not delivered
    TargetUnavailable {
        target: String,
        reason: UnavailableReason,
    },

    /// Relay tells a connection that another one took over its identifier
    RegistrationReplaced { id: String },
}

/// Envelope parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, no string `type`, or missing/invalid fields
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// `type` is a string outside [`KNOWN_TYPES`]
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
}

impl Envelope {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {}", e)))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => {
                return Err(ProtocolError::Malformed(
                    "missing string `type` field".to_string(),
                ))
            }
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("invalid `{}` envelope: {}", kind, e)))
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of this envelope's type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Call { .. } => "call",
            Self::IncomingCall { .. } => "incoming-call",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup { .. } => "hangup",
            Self::TargetUnavailable { .. } => "target-unavailable",
            Self::RegistrationReplaced { .. } => "registration-replaced",
        }
    }

    /// Destination identifier of a directed envelope
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Call { target } | Self::TargetUnavailable { target, .. } => Some(target),
            Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::IceCandidate { target, .. }
            | Self::Hangup { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    /// Relay-verified sender of a delivered envelope
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::IncomingCall { from } => Some(from),
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::Hangup { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    /// Whether a client is allowed to send this type to the relay
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Self::Register { .. }
                | Self::Call { .. }
                | Self::Offer { .. }
                | Self::Answer { .. }
                | Self::IceCandidate { .. }
                | Self::Hangup { .. }
        )
    }

    /// Rewrite a relayable envelope for delivery: `target` removed, `from`
    /// set to the verified sender. Returns `None` for non-relayable types.
    pub fn readdressed(self, sender: &str) -> Option<Self> {
        let from = Some(sender.to_string());
        match self {
            Self::Offer { data, .. } => Some(Self::Offer {
                target: None,
                from,
                data,
            }),
            Self::Answer { data, .. } => Some(Self::Answer {
                target: None,
                from,
                data,
            }),
            Self::IceCandidate { data, .. } => Some(Self::IceCandidate {
                target: None,
                from,
                data,
            }),
            Self::Hangup { .. } => Some(Self::Hangup { target: None, from }),
            _ => None,
        }
    }

    pub fn register(id: impl Into<String>) -> Self {
        Self::Register { id: id.into() }
    }

    pub fn registered(id: impl Into<String>) -> Self {
        Self::Registered { id: id.into() }
    }

    pub fn call(target: impl Into<String>) -> Self {
        Self::Call {
            target: target.into(),
        }
    }

    pub fn incoming_call(from: impl Into<String>) -> Self {
        Self::IncomingCall { from: from.into() }
    }

    pub fn offer(target: impl Into<String>, data: SessionDescription) -> Self {
        Self::Offer {
            target: Some(target.into()),
            from: None,
            data,
        }
    }

    pub fn answer(target: impl Into<String>, data: SessionDescription) -> Self {
        Self::Answer {
            target: Some(target.into()),
            from: None,
            data,
        }
    }

    pub fn ice_candidate(target: impl Into<String>, data: IceCandidate) -> Self {
        Self::IceCandidate {
            target: Some(target.into()),
            from: None,
            data,
        }
    }

    pub fn hangup(target: impl Into<String>) -> Self {
        Self::Hangup {
            target: Some(target.into()),
            from: None,
        }
    }

    /// Relay-generated hangup on behalf of `from`
    pub fn hangup_from(from: impl Into<String>) -> Self {
        Self::Hangup {
            target: None,
            from: Some(from.into()),
        }
    }

    pub fn registration_replaced(id: impl Into<String>) -> Self {
        Self::RegistrationReplaced { id: id.into() }
    }

    pub fn target_unavailable(target: impl Into<String>, reason: UnavailableReason) -> Self {
        Self::TargetUnavailable {
            target: target.into(),
            reason,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        if let Some(target) = self.target() {
            write!(f, " -> {}", target)?;
        }
        if let Some(from) = self.sender() {
            write!(f, " (from {})", from)?;
        }
        Ok(())
    }
}
