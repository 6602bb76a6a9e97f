//! Signaling relay end-to-end tests
//!
//! Each test starts a real relay on an ephemeral port and talks to it over
//! WebSocket.
//!
//! ```bash
//! cargo test -p peercall-signaling --test relay_e2e_test -- --nocapture
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_signaling::call::{
    DescriptionRole, MediaEngine, MediaEvent, MediaResult, PeerConnectionState,
};
use peercall_signaling::protocol::{IceCandidate, SessionDescription, UnavailableReason};
use peercall_signaling::{
    CallSession, CallState, ConflictPolicy, Envelope, RelayConfig, RelayEvent, SignalingClient,
    SignalingServer, SignalingServerHandle,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Initialize test logging (call once per test)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peercall_signaling=debug")
        .try_init();
}

fn local_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

async fn start_relay(config: RelayConfig) -> SignalingServerHandle {
    SignalingServer::bind(config)
        .await
        .expect("relay should bind an ephemeral port")
}

async fn connect(handle: &SignalingServerHandle) -> (SignalingClient, mpsc::Receiver<Envelope>) {
    SignalingClient::connect(&handle.url())
        .await
        .expect("client should connect")
}

async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("connection closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<Envelope>) {
    if let Ok(Some(envelope)) = timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("unexpected envelope: {:?}", envelope);
    }
}

async fn register(
    handle: &SignalingServerHandle,
    id: &str,
) -> (SignalingClient, mpsc::Receiver<Envelope>) {
    let (client, mut rx) = connect(handle).await;
    client.register(id).unwrap();
    assert_eq!(recv(&mut rx).await, Envelope::registered(id));
    (client, rx)
}

fn sdp(kind: &str) -> SessionDescription {
    SessionDescription(json!({"type": kind, "sdp": format!("v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\n", kind)}))
}

// ============================================================================
// Relay tests
// ============================================================================

#[tokio::test]
async fn test_alice_calls_bob() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let (alice, mut alice_rx) = register(&relay, "alice").await;
    let (bob, mut bob_rx) = register(&relay, "bob").await;

    alice.send(&Envelope::call("bob")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, Envelope::incoming_call("alice"));

    alice.send(&Envelope::offer("bob", sdp("offer"))).unwrap();
    match recv(&mut bob_rx).await {
        Envelope::Offer { from, data, target } => {
            assert_eq!(from.as_deref(), Some("alice"));
            assert_eq!(target, None);
            assert_eq!(data, sdp("offer"));
        }
        other => panic!("expected offer, got {:?}", other),
    }

    bob.send(&Envelope::answer("alice", sdp("answer"))).unwrap();
    match recv(&mut alice_rx).await {
        Envelope::Answer { from, data, .. } => {
            assert_eq!(from.as_deref(), Some("bob"));
            assert_eq!(data, sdp("answer"));
        }
        other => panic!("expected answer, got {:?}", other),
    }

    let candidate = IceCandidate(json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host", "sdpMid": "0"}));
    alice
        .send(&Envelope::ice_candidate("bob", candidate.clone()))
        .unwrap();
    match recv(&mut bob_rx).await {
        Envelope::IceCandidate { from, data, .. } => {
            assert_eq!(from.as_deref(), Some("alice"));
            assert_eq!(data, candidate);
        }
        other => panic!("expected ice-candidate, got {:?}", other),
    }

    // Exactly one incoming-call was delivered
    assert_quiet(&mut bob_rx).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_client_supplied_from_is_overwritten() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let (mallory, _mallory_rx) = register(&relay, "mallory").await;
    let (_bob, mut bob_rx) = register(&relay, "bob").await;

    mallory
        .send_text(r#"{"type":"offer","target":"bob","from":"alice","data":{"type":"offer","sdp":"v=0"}}"#)
        .unwrap();

    assert_eq!(recv(&mut bob_rx).await.sender(), Some("mallory"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unknown_target_and_garbage_are_ignored() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let (alice, mut alice_rx) = register(&relay, "alice").await;
    let (_bob, mut bob_rx) = register(&relay, "bob").await;

    alice.send(&Envelope::call("nobody")).unwrap();
    alice.send(&Envelope::offer("nobody", sdp("offer"))).unwrap();
    alice.send_text("definitely not json").unwrap();
    alice.send_text(r#"{"type":"peer.list"}"#).unwrap();
    alice.send_text(r#"{"type":"offer","target":"bob"}"#).unwrap();

    assert_quiet(&mut bob_rx).await;
    assert_quiet(&mut alice_rx).await;

    // The connection still works afterwards
    alice.send(&Envelope::call("bob")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, Envelope::incoming_call("alice"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_connection_cannot_route() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let (_bob, mut bob_rx) = register(&relay, "bob").await;
    let (stranger, _stranger_rx) = connect(&relay).await;

    stranger.send(&Envelope::call("bob")).unwrap();
    stranger.send(&Envelope::offer("bob", sdp("offer"))).unwrap();
    assert_quiet(&mut bob_rx).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_identifier_is_rejected() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let (_alice, _alice_rx) = register(&relay, "alice").await;
    let (impostor, mut impostor_rx) = connect(&relay).await;

    impostor.register("alice").unwrap();
    assert_quiet(&mut impostor_rx).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_replace_policy_hands_over_identifier() {
    init_logging();
    let mut config = local_config();
    config.registry.on_conflict = ConflictPolicy::Replace;
    let relay = start_relay(config).await;

    let (old, mut old_rx) = register(&relay, "alice").await;
    let (new, _new_rx) = register(&relay, "alice").await;
    let (_bob, mut bob_rx) = register(&relay, "bob").await;

    assert_eq!(
        recv(&mut old_rx).await,
        Envelope::registration_replaced("alice")
    );

    old.send(&Envelope::call("bob")).unwrap();
    assert_quiet(&mut bob_rx).await;

    new.send(&Envelope::call("bob")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, Envelope::incoming_call("alice"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_frees_identifier_and_notifies_peer() {
    init_logging();
    let mut config = local_config();
    config.routing.notify_unavailable = true;
    let relay = start_relay(config).await;

    let (alice, _alice_rx) = register(&relay, "alice").await;
    let (bob, mut bob_rx) = register(&relay, "bob").await;

    alice.send(&Envelope::call("bob")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, Envelope::incoming_call("alice"));

    alice.close();
    assert_eq!(recv(&mut bob_rx).await, Envelope::hangup_from("alice"));

    // Nothing is routed to the departed endpoint
    bob.send(&Envelope::offer("alice", sdp("offer"))).unwrap();
    assert_eq!(
        recv(&mut bob_rx).await,
        Envelope::target_unavailable("alice", UnavailableReason::NotRegistered)
    );

    // The identifier is available again straight away
    let (_alice2, mut alice2_rx) = register(&relay, "alice").await;
    assert_quiet(&mut alice2_rx).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_notify_unavailable_and_busy() {
    init_logging();
    let mut config = local_config();
    config.routing.notify_unavailable = true;
    config.routing.reject_busy_targets = true;
    let relay = start_relay(config).await;

    let (alice, _alice_rx) = register(&relay, "alice").await;
    let (_bob, mut bob_rx) = register(&relay, "bob").await;
    let (carol, mut carol_rx) = register(&relay, "carol").await;

    carol.send(&Envelope::call("nobody")).unwrap();
    assert_eq!(
        recv(&mut carol_rx).await,
        Envelope::target_unavailable("nobody", UnavailableReason::NotRegistered)
    );

    alice.send(&Envelope::call("bob")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, Envelope::incoming_call("alice"));

    carol.send(&Envelope::call("bob")).unwrap();
    assert_eq!(
        recv(&mut carol_rx).await,
        Envelope::target_unavailable("bob", UnavailableReason::Busy)
    );
    assert_quiet(&mut bob_rx).await;

    relay.shutdown().await;
}

async fn next(rx: &mut mpsc::Receiver<RelayEvent>) -> RelayEvent {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for relay event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_relay_events_are_emitted() {
    init_logging();
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let relay = SignalingServer::new_with_events(local_config(), Some(event_tx))
        .start()
        .await
        .unwrap();

    let (alice, _alice_rx) = register(&relay, "alice").await;

    assert_eq!(
        next(&mut event_rx).await,
        RelayEvent::registered("alice".to_string(), false)
    );

    alice.send(&Envelope::call("bob")).unwrap();
    assert_eq!(next(&mut event_rx).await.name(), "dropped");

    alice.close();
    assert_eq!(
        next(&mut event_rx).await,
        RelayEvent::unregistered("alice".to_string())
    );

    relay.shutdown().await;
}

// ============================================================================
// Call sessions over the relay
// ============================================================================

/// Media engine that produces canned descriptions and records calls
#[derive(Default)]
struct CannedEngine {
    log: Mutex<Vec<&'static str>>,
}

impl CannedEngine {
    fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for CannedEngine {
    async fn acquire_local_media(&self) -> MediaResult<()> {
        self.log.lock().push("acquire");
        Ok(())
    }

    async fn create_connection(&self, _peer: &str) -> MediaResult<()> {
        self.log.lock().push("connect");
        Ok(())
    }

    async fn create_local_description(
        &self,
        role: DescriptionRole,
    ) -> MediaResult<SessionDescription> {
        Ok(match role {
            DescriptionRole::Offer => sdp("offer"),
            DescriptionRole::Answer => sdp("answer"),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> MediaResult<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> MediaResult<()> {
        self.log.lock().push("remote");
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> MediaResult<()> {
        self.log.lock().push("candidate");
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        self.log.lock().push("close");
        Ok(())
    }
}

struct Endpoint {
    session: CallSession<CannedEngine>,
    engine: Arc<CannedEngine>,
    inbound: mpsc::Receiver<Envelope>,
}

impl Endpoint {
    async fn join(relay: &SignalingServerHandle, id: &str) -> Self {
        let (client, inbound) = connect(relay).await;
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        client.forward(outbound_rx);

        let engine = Arc::new(CannedEngine::default());
        let mut endpoint = Self {
            session: CallSession::new(Arc::clone(&engine), outbound_tx),
            engine,
            inbound,
        };
        endpoint.session.register(id).await.unwrap();
        endpoint.pump().await;
        assert_eq!(endpoint.session.local_id(), Some(id));
        endpoint
    }

    /// Apply the next inbound envelope to the session
    async fn pump(&mut self) -> CallState {
        let envelope = recv(&mut self.inbound).await;
        self.session.handle_envelope(envelope).await.unwrap()
    }
}

#[tokio::test]
async fn test_sessions_negotiate_through_relay() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let mut alice = Endpoint::join(&relay, "alice").await;
    let mut bob = Endpoint::join(&relay, "bob").await;

    alice.session.dial("bob").await.unwrap();
    assert_eq!(alice.session.state(), CallState::Calling);

    assert_eq!(bob.pump().await, CallState::Ringing);
    assert_eq!(bob.pump().await, CallState::Negotiating);

    assert_eq!(alice.pump().await, CallState::Negotiating);

    // Trickle one candidate each way
    alice
        .session
        .handle_media_event(MediaEvent::LocalIceCandidate(IceCandidate(
            json!({"candidate": "a"}),
        )))
        .await
        .unwrap();
    bob.pump().await;
    assert!(bob.engine.log().contains(&"candidate"));

    for endpoint in [&mut alice, &mut bob] {
        let state = endpoint
            .session
            .handle_media_event(MediaEvent::ConnectionStateChanged(
                PeerConnectionState::Connected,
            ))
            .await
            .unwrap();
        assert_eq!(state, CallState::Connected);
    }

    bob.session.hangup().await.unwrap();
    assert_eq!(bob.session.state(), CallState::Ended);
    assert_eq!(alice.pump().await, CallState::Ended);

    assert_eq!(alice.engine.log().iter().filter(|c| **c == "close").count(), 1);
    assert_eq!(bob.engine.log().iter().filter(|c| **c == "close").count(), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_session_ends_when_peer_disconnects() {
    init_logging();
    let relay = start_relay(local_config()).await;

    let mut alice = Endpoint::join(&relay, "alice").await;
    let (bob, mut bob_rx) = register(&relay, "bob").await;

    alice.session.dial("bob").await.unwrap();
    assert_eq!(recv(&mut bob_rx).await.kind(), "incoming-call");
    assert_eq!(recv(&mut bob_rx).await.kind(), "offer");

    bob.close();
    assert_eq!(alice.pump().await, CallState::Ended);
    assert!(alice.engine.log().contains(&"close"));

    relay.shutdown().await;
}
