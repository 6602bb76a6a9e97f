//! WebSocket signaling client
//!
//! Connects to a relay, sends envelopes and hands inbound envelopes to the
//! caller over a channel, typically to drive a [`CallSession`](crate::call::CallSession).
//!
//! # Example
//!
//! ```no_run
//! use peercall_signaling::{Envelope, SignalingClient};
//!
//! # tokio_test::block_on(async {
//! let (client, mut inbound) = SignalingClient::connect("ws://127.0.0.1:3000").await?;
//! client.register("alice")?;
//!
//! while let Some(envelope) = inbound.recv().await {
//!     if let Envelope::Registered { id } = envelope {
//!         println!("registered as {}", id);
//!         client.send(&Envelope::call("bob"))?;
//!     }
//! }
//! # Ok::<(), peercall_signaling::Error>(())
//! # });
//! ```

use crate::protocol::Envelope;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound envelopes buffered before the reader waits on the consumer
const INBOUND_QUEUE: usize = 128;

/// WebSocket signaling client
#[derive(Debug, Clone)]
pub struct SignalingClient {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl SignalingClient {
    /// Connect to the relay at `url` (ws:// or wss://).
    ///
    /// Returns the client and the stream of envelopes the relay delivers.
    /// The stream ends when the connection closes.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<Envelope>)> {
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok((
            Self {
                url: url.to_string(),
                tx,
            },
            inbound_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue an envelope for the relay
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_json()?;
        debug!("Sending {}", envelope);
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::ChannelClosed("signaling connection closed".to_string()))
    }

    /// Ask the relay to register `id`
    pub fn register(&self, id: &str) -> Result<()> {
        self.send(&Envelope::register(id))
    }

    /// Send a raw text frame, bypassing envelope serialization
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| Error::ChannelClosed("signaling connection closed".to_string()))
    }

    /// Forward every envelope from `outbound` to the relay until either side closes
    pub fn forward(&self, mut outbound: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                if let Err(e) = client.send(&envelope) {
                    warn!("Stopped forwarding to relay: {}", e);
                    break;
                }
            }
        })
    }

    /// Close the connection
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound: mpsc::Sender<Envelope>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        if inbound.send(envelope).await.is_err() {
                            debug!("Inbound receiver dropped");
                            break;
                        }
                    }
                    Err(e) => warn!("Skipping signaling message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}
