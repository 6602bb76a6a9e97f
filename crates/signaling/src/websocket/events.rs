//! Relay event types
//!
//! Emitted by the connection handler so an embedding process can observe
//! registrations and routing without touching the registry.

use crate::protocol::UnavailableReason;
use crate::registry::RegistryError;
use crate::router::{DropReason, RoutingOutcome};
use crate::Error;

/// Something the relay did
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// An identifier was bound to a connection
    Registered {
        /// Registered identifier
        id: String,
        /// Another connection held the identifier until now
        replaced: bool,
    },

    /// A registration was refused
    RegistrationRejected {
        /// Why the registry refused it
        reason: RegistryError,
    },

    /// An endpoint's connection closed and its identifier was released
    Unregistered {
        /// Released identifier
        id: String,
    },

    /// An envelope was queued for its target
    Routed {
        /// Envelope type
        kind: &'static str,
        /// Verified sender
        from: String,
        /// Recipient identifier
        to: String,
    },

    /// An envelope went nowhere
    Dropped {
        /// Envelope type, or the unknown `type` value
        kind: String,
        /// Sender, if registered
        from: Option<String>,
        /// Why it was dropped
        reason: String,
    },
}

impl RelayEvent {
    /// Create a registered event
    pub fn registered(id: String, replaced: bool) -> Self {
        Self::Registered { id, replaced }
    }

    /// Create an unregistered event
    pub fn unregistered(id: String) -> Self {
        Self::Unregistered { id }
    }

    /// Create a routed event
    pub fn routed(kind: &'static str, from: String, to: String) -> Self {
        Self::Routed { kind, from, to }
    }

    /// Create a dropped event
    pub fn dropped(kind: impl Into<String>, from: Option<String>, reason: impl Into<String>) -> Self {
        Self::Dropped {
            kind: kind.into(),
            from,
            reason: reason.into(),
        }
    }

    /// Describe what the router did with a `kind` envelope from `from`
    pub fn from_outcome(kind: &'static str, from: Option<&str>, outcome: RoutingOutcome) -> Self {
        let from = from.map(str::to_string);
        match outcome {
            RoutingOutcome::Registered { id, displaced } => {
                Self::registered(id, displaced.is_some())
            }
            RoutingOutcome::Rejected(reason) => Self::RegistrationRejected { reason },
            RoutingOutcome::Delivered { kind, to } => {
                Self::routed(kind, from.unwrap_or_default(), to)
            }
            RoutingOutcome::Dropped(reason) => Self::dropped(kind, from, describe(&reason)),
        }
    }

    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::RegistrationRejected { .. } => "registration_rejected",
            Self::Unregistered { .. } => "unregistered",
            Self::Routed { .. } => "routed",
            Self::Dropped { .. } => "dropped",
        }
    }
}

fn describe(reason: &DropReason) -> String {
    match reason {
        DropReason::NotRegistered => "sender not registered".to_string(),
        DropReason::ServerOnly(kind) => format!("`{}` is relay-only", kind),
        DropReason::MissingTarget(kind) => format!("`{}` has no target", kind),
        DropReason::SelfAddressed => "addressed to sender".to_string(),
        DropReason::TargetUnavailable {
            target,
            reason: UnavailableReason::NotRegistered,
        } => Error::UnknownTarget(target.clone()).to_string(),
        DropReason::TargetUnavailable { target, reason } => {
            format!("{} unavailable ({:?})", target, reason)
        }
        DropReason::QueueFull(target) => format!("queue for {} full", target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_event() {
        let event = RelayEvent::from_outcome(
            "register",
            None,
            RoutingOutcome::Registered {
                id: "alice".to_string(),
                displaced: None,
            },
        );
        assert_eq!(event, RelayEvent::registered("alice".to_string(), false));
        assert_eq!(event.name(), "registered");
    }

    #[test]
    fn test_routed_event() {
        let event = RelayEvent::from_outcome(
            "offer",
            Some("alice"),
            RoutingOutcome::Delivered {
                kind: "offer",
                to: "bob".to_string(),
            },
        );
        assert_eq!(
            event,
            RelayEvent::routed("offer", "alice".to_string(), "bob".to_string())
        );
    }

    #[test]
    fn test_dropped_event() {
        let event = RelayEvent::from_outcome(
            "call",
            Some("alice"),
            RoutingOutcome::Dropped(DropReason::TargetUnavailable {
                target: "bob".to_string(),
                reason: UnavailableReason::NotRegistered,
            }),
        );
        assert_eq!(event.name(), "dropped");
        if let RelayEvent::Dropped { kind, from, reason } = event {
            assert_eq!(kind, "call");
            assert_eq!(from.as_deref(), Some("alice"));
            assert_eq!(reason, "Unknown target: bob");
        } else {
            panic!("Expected Dropped event");
        }
    }

    #[test]
    fn test_busy_drop_reason() {
        let event = RelayEvent::from_outcome(
            "call",
            Some("carol"),
            RoutingOutcome::Dropped(DropReason::TargetUnavailable {
                target: "bob".to_string(),
                reason: UnavailableReason::Busy,
            }),
        );
        assert_eq!(
            event,
            RelayEvent::dropped("call", Some("carol".to_string()), "bob unavailable (Busy)")
        );
    }
}
