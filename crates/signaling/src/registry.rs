//! Identity registry: identifier -> live endpoint
//!
//! The registry is the only place identifiers are bound to connections. It
//! is an owned value injected into the router, never ambient state.
//! Locks are `parking_lot` and are never held across an `.await`.

use crate::call::{CallError, CallEvent, CallState, CallStateMachine, Transition};
use crate::protocol::Envelope;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Longest identifier accepted, in characters
pub const MAX_IDENTIFIER_LEN: usize = 50;

/// One transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when an identifier is already registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse the newcomer with `IdentifierTaken`
    #[default]
    Reject,
    /// Atomically hand the identifier to the newcomer
    Replace,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ConflictPolicy::Reject),
            "replace" => Ok(ConflictPolicy::Replace),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

/// Registration failure; the registry is left unchanged
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("identifier already taken: {0}")]
    IdentifierTaken(String),
}

/// Why a delivery attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The endpoint's outbound queue is full
    QueueFull,
    /// The endpoint's transport is gone
    Closed,
}

/// Check and normalize a requested identifier.
///
/// Surrounding whitespace is trimmed. The result must be non-empty, at most
/// [`MAX_IDENTIFIER_LEN`] characters, and use only ASCII letters, digits,
/// `-`, `_` and `.`.
pub fn validate_identifier(raw: &str) -> Result<String, RegistryError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(RegistryError::InvalidIdentifier(
            "identifier is empty".to_string(),
        ));
    }
    let len = id.chars().count();
    if len > MAX_IDENTIFIER_LEN {
        return Err(RegistryError::InvalidIdentifier(format!(
            "identifier is {} characters, limit is {}",
            len, MAX_IDENTIFIER_LEN
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(RegistryError::InvalidIdentifier(format!(
            "character {:?} is not allowed",
            bad
        )));
    }
    Ok(id.to_string())
}

/// Relay-side view of the call an endpoint takes part in
#[derive(Debug)]
pub struct CallRecord {
    machine: CallStateMachine,
    since: Instant,
}

impl CallRecord {
    fn new() -> Self {
        Self {
            machine: CallStateMachine::new(),
            since: Instant::now(),
        }
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn peer(&self) -> Option<&str> {
        self.machine.peer()
    }

    /// Apply an event, restamping the record when the state changes
    pub fn apply(&mut self, event: CallEvent) -> Result<Transition, CallError> {
        let transition = self.machine.apply(event)?;
        if transition.changed() {
            self.since = Instant::now();
        }
        Ok(transition)
    }

    /// In a live call with someone other than `other`.
    ///
    /// Setup-phase records older than `setup_timeout` are expired first.
    pub fn is_engaged_elsewhere(&mut self, other: &str, setup_timeout: Duration) -> bool {
        if self.machine.is_setup_phase() && self.since.elapsed() >= setup_timeout {
            let _ = self.apply(CallEvent::SetupTimeout);
        }
        self.machine.is_active() && self.machine.peer() != Some(other)
    }
}

/// A registered endpoint
#[derive(Debug)]
pub struct Endpoint {
    identifier: String,
    connection: ConnectionId,
    tx: mpsc::Sender<Envelope>,
    call: Mutex<CallRecord>,
}

impl Endpoint {
    fn new(identifier: String, connection: ConnectionId, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            identifier,
            connection,
            tx,
            call: Mutex::new(CallRecord::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Transport still accepting envelopes
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an envelope without waiting
    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryFailure> {
        self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::QueueFull,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Lock this endpoint's call record
    pub fn call(&self) -> parking_lot::MutexGuard<'_, CallRecord> {
        self.call.lock()
    }
}

/// Successful registration
#[derive(Debug, Clone)]
pub struct RegisteredIdentifier {
    pub endpoint: Arc<Endpoint>,
    /// Previous holder removed under [`ConflictPolicy::Replace`]
    pub displaced: Option<Arc<Endpoint>>,
}

impl RegisteredIdentifier {
    pub fn identifier(&self) -> &str {
        self.endpoint.identifier()
    }
}

/// Process-wide identifier map
#[derive(Debug, Default)]
pub struct Registry {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    policy: ConflictPolicy,
}

impl Registry {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Bind `identifier` to a connection's outbound queue.
    ///
    /// Registering again from the same connection under the same identifier
    /// returns the existing entry. An entry whose transport has closed is
    /// always replaced.
    pub fn register(
        &self,
        identifier: &str,
        connection: ConnectionId,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<RegisteredIdentifier, RegistryError> {
        let id = validate_identifier(identifier)?;

        let mut endpoints = self.endpoints.write();
        let displaced = match endpoints.get(&id) {
            Some(existing) if existing.connection() == connection => {
                return Ok(RegisteredIdentifier {
                    endpoint: Arc::clone(existing),
                    displaced: None,
                });
            }
            Some(existing) if existing.is_open() && self.policy == ConflictPolicy::Reject => {
                return Err(RegistryError::IdentifierTaken(id));
            }
            Some(existing) => Some(Arc::clone(existing)),
            None => None,
        };

        let endpoint = Arc::new(Endpoint::new(id.clone(), connection, tx));
        endpoints.insert(id, Arc::clone(&endpoint));

        Ok(RegisteredIdentifier {
            endpoint,
            displaced,
        })
    }

    /// Endpoint registered under `identifier`
    pub fn lookup(&self, identifier: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(identifier).cloned()
    }

    /// Remove `identifier`; no-op if absent
    pub fn unregister(&self, identifier: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.write().remove(identifier)
    }

    /// Remove `identifier` only if `connection` still holds it
    pub fn release(&self, identifier: &str, connection: ConnectionId) -> Option<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.write();
        match endpoints.get(identifier) {
            Some(existing) if existing.connection() == connection => endpoints.remove(identifier),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}
