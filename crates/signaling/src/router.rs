//! Message router
//!
//! Decides what happens to each envelope a connection sends: registration,
//! call setup, relaying of descriptions and candidates. Routing never awaits;
//! every delivery is a `try_send` onto the target's bounded queue.

use crate::call::{CallError, CallEvent};
use crate::config::RoutingConfig;
use crate::protocol::{Envelope, UnavailableReason};
use crate::registry::{ConnectionId, DeliveryFailure, Endpoint, Registry, RegistryError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One client transport as seen by the router
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
    identifier: Option<String>,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            identifier: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identifier this connection last registered
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }
}

/// Why an envelope went nowhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Sender has not registered, or lost its identifier to a replacement
    NotRegistered,
    /// Type only the relay may send
    ServerOnly(&'static str),
    /// Directed type without a `target`
    MissingTarget(&'static str),
    /// Sender addressed itself
    SelfAddressed,
    /// Target absent, closed or busy
    TargetUnavailable {
        target: String,
        reason: UnavailableReason,
    },
    /// Target's outbound queue is full
    QueueFull(String),
}

/// What the router did with one envelope
#[derive(Debug, Clone)]
pub enum RoutingOutcome {
    /// Identifier bound to this connection
    Registered {
        id: String,
        /// Connection that held the identifier before a replacement
        displaced: Option<ConnectionId>,
    },
    /// Registration refused; the connection keeps its previous identifier
    Rejected(RegistryError),
    /// Envelope queued for `to`
    Delivered { kind: &'static str, to: String },
    Dropped(DropReason),
}

impl RoutingOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RoutingOutcome::Delivered { .. })
    }
}

/// Routes envelopes between registered endpoints
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    config: RoutingConfig,
}

impl Router {
    pub fn new(registry: Arc<Registry>, config: RoutingConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one inbound envelope from `conn`
    pub fn route(&self, conn: &mut Connection, envelope: Envelope) -> RoutingOutcome {
        if let Envelope::Register { id } = &envelope {
            return self.register(conn, id);
        }

        if !envelope.is_client_originated() {
            warn!(
                "Dropping server-only `{}` sent by connection {}",
                envelope.kind(),
                conn.id
            );
            return RoutingOutcome::Dropped(DropReason::ServerOnly(envelope.kind()));
        }

        let sender = match self.sender_of(conn) {
            Some(endpoint) => endpoint,
            None => {
                debug!(
                    "Dropping `{}` from unregistered connection {}",
                    envelope.kind(),
                    conn.id
                );
                return RoutingOutcome::Dropped(DropReason::NotRegistered);
            }
        };

        match envelope {
            Envelope::Call { target } => self.route_call(&sender, target),
            other => self.relay(&sender, other),
        }
    }

    /// Release everything `conn` held. Returns the identifier it gave up.
    pub fn disconnect(&self, conn: &Connection) -> Option<String> {
        let id = conn.identifier()?;
        let endpoint = self.registry.release(id, conn.id)?;
        info!("Unregistered {} (connection {})", id, conn.id);
        self.end_call(&endpoint);
        Some(id.to_string())
    }

    fn register(&self, conn: &mut Connection, requested: &str) -> RoutingOutcome {
        let registration = match self.registry.register(requested, conn.id, conn.tx.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Registration refused for connection {}: {}", conn.id, e);
                return RoutingOutcome::Rejected(e);
            }
        };
        let id = registration.identifier().to_string();

        if let Some(previous) = conn.identifier.take().filter(|p| *p != id) {
            if let Some(old) = self.registry.release(&previous, conn.id) {
                info!("Connection {} released {} for {}", conn.id, previous, id);
                self.end_call(&old);
            }
        }

        let displaced = registration.displaced.map(|old| {
            info!(
                "{} moved from connection {} to {}",
                id,
                old.connection(),
                conn.id
            );
            self.end_call(&old);
            if old.deliver(Envelope::registration_replaced(id.clone())).is_err() {
                debug!("Could not tell connection {} it lost {}", old.connection(), id);
            }
            old.connection()
        });

        conn.identifier = Some(id.clone());
        info!("Registered {} (total: {})", id, self.registry.len());

        if registration
            .endpoint
            .deliver(Envelope::registered(id.clone()))
            .is_err()
        {
            warn!("Could not confirm registration to {}", id);
        }

        RoutingOutcome::Registered { id, displaced }
    }

    /// Registered endpoint still owned by `conn`
    fn sender_of(&self, conn: &mut Connection) -> Option<Arc<Endpoint>> {
        let id = conn.identifier.as_deref()?;
        match self.registry.lookup(id) {
            Some(endpoint) if endpoint.connection() == conn.id => Some(endpoint),
            _ => {
                conn.identifier = None;
                None
            }
        }
    }

    fn route_call(&self, sender: &Arc<Endpoint>, target: String) -> RoutingOutcome {
        if target == sender.identifier() {
            return RoutingOutcome::Dropped(DropReason::SelfAddressed);
        }

        let callee = match self.reachable(&target) {
            Some(callee) => callee,
            None => return self.unavailable(sender, target, UnavailableReason::NotRegistered),
        };
        if self.is_busy(&callee, sender.identifier()) {
            return self.unavailable(sender, target, UnavailableReason::Busy);
        }

        let outcome = self.deliver(&callee, Envelope::incoming_call(sender.identifier()));
        if !outcome.is_delivered() {
            return outcome;
        }

        self.start_outgoing(sender, &target);
        if let Err(e) = callee
            .call()
            .apply(CallEvent::IncomingCall(sender.identifier().to_string()))
        {
            debug!("{} rung while not idle: {}", target, e);
        }
        outcome
    }

    /// Move the sender's record to `Calling`, ending whatever call it had
    fn start_outgoing(&self, sender: &Arc<Endpoint>, target: &str) {
        let abandoned = {
            let mut record = sender.call();
            match record.apply(CallEvent::Dial(target.to_string())) {
                Ok(_) => None,
                Err(e) => {
                    let previous = match e {
                        CallError::Busy { current, .. } => Some(current),
                        CallError::InvalidTransition { .. } => None,
                    };
                    let _ = record.apply(CallEvent::Hangup);
                    let _ = record.apply(CallEvent::Dial(target.to_string()));
                    previous
                }
            }
        };

        if let Some(previous) = abandoned {
            info!(
                "{} abandoned call with {} to call {}",
                sender.identifier(),
                previous,
                target
            );
            self.hang_up_peer(sender.identifier(), &previous);
        }
    }

    fn relay(&self, sender: &Arc<Endpoint>, envelope: Envelope) -> RoutingOutcome {
        let kind = envelope.kind();
        let target = match envelope.target() {
            Some(target) => target.to_string(),
            None => {
                debug!("Dropping `{}` without target from {}", kind, sender.identifier());
                return RoutingOutcome::Dropped(DropReason::MissingTarget(kind));
            }
        };
        if target == sender.identifier() {
            return RoutingOutcome::Dropped(DropReason::SelfAddressed);
        }

        let is_offer = matches!(envelope, Envelope::Offer { .. });
        let recipient = match self.reachable(&target) {
            Some(recipient) => recipient,
            None if is_offer => {
                return self.unavailable(sender, target, UnavailableReason::NotRegistered)
            }
            None => {
                debug!("Dropping `{}` for unknown target {}", kind, target);
                return RoutingOutcome::Dropped(DropReason::TargetUnavailable {
                    target,
                    reason: UnavailableReason::NotRegistered,
                });
            }
        };
        if is_offer && self.is_busy(&recipient, sender.identifier()) {
            return self.unavailable(sender, target, UnavailableReason::Busy);
        }

        // A sender's hangup ends its own record whether or not the peer hears it
        if matches!(envelope, Envelope::Hangup { .. }) {
            end_if_peer(sender, &target);
        }

        let outcome = match envelope.readdressed(sender.identifier()) {
            Some(delivered) => self.deliver(&recipient, delivered),
            None => return RoutingOutcome::Dropped(DropReason::ServerOnly(kind)),
        };
        if outcome.is_delivered() {
            self.track(sender, &recipient, kind);
        }
        outcome
    }

    /// Mirror a delivered envelope of type `kind` into both endpoints' call
    /// records.
    ///
    /// Records are advisory; a refused transition is only logged.
    fn track(&self, sender: &Endpoint, recipient: &Endpoint, kind: &str) {
        let from = sender.identifier().to_string();
        let to = recipient.identifier().to_string();

        let (outgoing, incoming) = match kind {
            "offer" => (
                CallEvent::OfferSent(to.clone()),
                CallEvent::OfferReceived(from.clone()),
            ),
            "answer" => (
                CallEvent::AnswerSent(to.clone()),
                CallEvent::AnswerReceived(from.clone()),
            ),
            "ice-candidate" => (
                CallEvent::IceCandidate(to.clone()),
                CallEvent::IceCandidate(from.clone()),
            ),
            "hangup" => {
                end_if_peer(recipient, &from);
                return;
            }
            _ => return,
        };

        if let Err(e) = sender.call().apply(outgoing) {
            debug!("{} sent `{}` to {}: {}", from, kind, to, e);
        }
        if let Err(e) = recipient.call().apply(incoming) {
            debug!("{} received `{}` from {}: {}", to, kind, from, e);
        }
    }

    /// End `endpoint`'s call and tell its peer
    fn end_call(&self, endpoint: &Endpoint) {
        let peer = {
            let mut record = endpoint.call();
            let was_active = record.state().is_active();
            let peer = record.peer().map(str::to_string);
            let _ = record.apply(CallEvent::Hangup);
            peer.filter(|_| was_active)
        };

        if let Some(peer) = peer {
            self.hang_up_peer(endpoint.identifier(), &peer);
        }
    }

    /// Send `hangup{from}` to `peer` and end its record if it was with `from`
    fn hang_up_peer(&self, from: &str, peer: &str) {
        let endpoint = match self.registry.lookup(peer) {
            Some(endpoint) => endpoint,
            None => return,
        };
        end_if_peer(&endpoint, from);
        if endpoint.deliver(Envelope::hangup_from(from)).is_err() {
            debug!("Could not deliver hangup from {} to {}", from, peer);
        }
    }

    fn reachable(&self, identifier: &str) -> Option<Arc<Endpoint>> {
        self.registry
            .lookup(identifier)
            .filter(|endpoint| endpoint.is_open())
    }

    fn is_busy(&self, target: &Endpoint, caller: &str) -> bool {
        self.config.reject_busy_targets
            && target
                .call()
                .is_engaged_elsewhere(caller, self.config.call_setup_timeout())
    }

    fn unavailable(
        &self,
        sender: &Endpoint,
        target: String,
        reason: UnavailableReason,
    ) -> RoutingOutcome {
        warn!(
            "{} -> {} not delivered: {:?}",
            sender.identifier(),
            target,
            reason
        );
        if self.config.notify_unavailable {
            let _ = sender.deliver(Envelope::target_unavailable(target.clone(), reason));
        }
        RoutingOutcome::Dropped(DropReason::TargetUnavailable { target, reason })
    }

    fn deliver(&self, recipient: &Endpoint, envelope: Envelope) -> RoutingOutcome {
        let kind = envelope.kind();
        let to = recipient.identifier().to_string();
        debug!("Routing {}", envelope);

        match recipient.deliver(envelope) {
            Ok(()) => RoutingOutcome::Delivered { kind, to },
            Err(DeliveryFailure::QueueFull) => {
                warn!("Outbound queue for {} full, dropping `{}`", to, kind);
                RoutingOutcome::Dropped(DropReason::QueueFull(to))
            }
            Err(DeliveryFailure::Closed) => {
                debug!("{} closed before `{}` could be queued", to, kind);
                RoutingOutcome::Dropped(DropReason::TargetUnavailable {
                    target: to,
                    reason: UnavailableReason::NotRegistered,
                })
            }
        }
    }
}

fn end_if_peer(endpoint: &Endpoint, peer: &str) {
    let mut record = endpoint.call();
    if record.peer() == Some(peer) {
        let _ = record.apply(CallEvent::Hangup);
    }
}
