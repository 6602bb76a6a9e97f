//! WebSocket signaling relay server
//!
//! Binds the listener, then runs the accept loop as a task on the caller's
//! runtime until the handle is shut down.

use super::events::RelayEvent;
use super::handler::{handle_connection, SharedState};
use crate::config::RelayConfig;
use crate::registry::Registry;
use crate::router::Router;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling relay
pub struct SignalingServer {
    config: RelayConfig,
    state: Arc<SharedState>,
}

impl SignalingServer {
    /// Create a relay without event forwarding
    pub fn new(config: RelayConfig) -> Self {
        Self::new_with_events(config, None)
    }

    /// Create a relay with event forwarding
    pub fn new_with_events(config: RelayConfig, event_tx: Option<mpsc::Sender<RelayEvent>>) -> Self {
        let registry = Arc::new(Registry::new(config.registry.on_conflict));
        let router = Router::new(registry, config.routing.clone());
        let state = Arc::new(SharedState::new_with_events(
            router,
            config.server.outbound_queue,
            event_tx,
        ));

        Self { config, state }
    }

    /// Bind and start a relay in one step
    pub async fn bind(config: RelayConfig) -> Result<SignalingServerHandle> {
        Self::new(config).start().await
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(self) -> Result<SignalingServerHandle> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!("Failed to bind signaling relay to {}: {}", addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!("Signaling relay listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let state = self.state;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let state_clone = Arc::clone(&state);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state_clone).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signaling relay received shutdown signal");
                        break;
                    }
                }
            }

            info!("Signaling relay accept loop exited");
        });

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle for controlling a running relay
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SignalingServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to signaling relay");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Signaling relay task failed: {}", e);
        }
    }
}
