//! WebSocket connection handler
//!
//! One task per connection: a forward task drains the bounded outbound queue
//! into the socket while the read loop parses and routes inbound frames.

use super::events::RelayEvent;
use crate::protocol::{Envelope, ProtocolError};
use crate::router::{Connection, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// Shared state across all WebSocket connections
pub struct SharedState {
    router: Router,
    outbound_queue: usize,
    /// Optional event sender; when set, registrations and routing
    /// decisions are forwarded
    event_tx: Option<mpsc::Sender<RelayEvent>>,
}

impl SharedState {
    /// Create new shared state without event forwarding
    pub fn new(router: Router, outbound_queue: usize) -> Self {
        Self::new_with_events(router, outbound_queue, None)
    }

    /// Create new shared state with optional event forwarding
    pub fn new_with_events(
        router: Router,
        outbound_queue: usize,
        event_tx: Option<mpsc::Sender<RelayEvent>>,
    ) -> Self {
        Self {
            router,
            outbound_queue: outbound_queue.max(1),
            event_tx,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Emit an event if event_tx is configured
    pub async fn emit_event(&self, event: RelayEvent) {
        if let Some(ref tx) = self.event_tx {
            if let Err(e) = tx.send(event).await {
                warn!("Failed to emit relay event: {}", e);
            }
        }
    }
}

/// Handle a single WebSocket connection
pub async fn handle_connection(stream: TcpStream, state: Arc<SharedState>) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    info!("New WebSocket connection from: {}", addr);

    let ws_stream = accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    // Queue for envelopes routed to this connection
    let (tx, mut rx) = mpsc::channel::<Envelope>(state.outbound_queue);
    let mut conn = Connection::new(tx);

    let ws_tx = Arc::new(Mutex::new(ws_tx));
    let ws_tx_clone = Arc::clone(&ws_tx);
    let forward_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {}: {}", envelope, e);
                    continue;
                }
            };
            let mut ws_tx = ws_tx_clone.lock().await;
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_message(&text, &state, &mut conn).await;
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame from {}", data.len(), addr);
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket connection closed by client: {}", addr);
                break;
            }
            Ok(Message::Ping(data)) => {
                let mut ws_tx = ws_tx.lock().await;
                let _ = ws_tx.send(Message::Pong(data)).await;
            }
            Err(e) => {
                error!("WebSocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect; queued envelopes are not flushed
    if let Some(id) = state.router.disconnect(&conn) {
        info!("Cleaning up endpoint: {}", id);
        state.emit_event(RelayEvent::unregistered(id)).await;
    }

    forward_task.abort();

    Ok(())
}

/// Parse and route one text frame
async fn handle_message(text: &str, state: &SharedState, conn: &mut Connection) {
    let sender = conn.identifier().map(str::to_string);

    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(ProtocolError::UnknownType(kind)) => {
            warn!("Unknown message type from {}: {}", describe_sender(&sender, conn), kind);
            state
                .emit_event(RelayEvent::dropped(kind, sender, "unknown message type"))
                .await;
            return;
        }
        Err(e) => {
            warn!("Dropping frame from {}: {}", describe_sender(&sender, conn), e);
            state
                .emit_event(RelayEvent::dropped("", sender, e.to_string()))
                .await;
            return;
        }
    };

    let kind = envelope.kind();
    let outcome = state.router.route(conn, envelope);
    state
        .emit_event(RelayEvent::from_outcome(kind, sender.as_deref(), outcome))
        .await;
}

fn describe_sender(sender: &Option<String>, conn: &Connection) -> String {
    match sender {
        Some(id) => id.clone(),
        None => format!("connection {}", conn.id()),
    }
}
