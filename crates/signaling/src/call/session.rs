//! Per-endpoint call driver
//!
//! A [`CallSession`] runs on the peer side of the relay. It owns the
//! endpoint's [`CallStateMachine`], talks to the [`MediaEngine`] and queues
//! outbound envelopes for the signaling connection. Every input goes through
//! `&mut self`, so transitions for one endpoint never interleave.

use super::media::{DescriptionRole, MediaEngine, MediaEvent, PeerConnectionState};
use super::state::{CallError, CallEvent, CallState, CallStateMachine, Transition};
use crate::protocol::{Envelope, IceCandidate, SessionDescription};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunables for a [`CallSession`]
#[derive(Debug, Clone)]
pub struct CallSessionConfig {
    /// How long `Calling`/`Ringing` may last before the call is abandoned
    pub call_setup_timeout: Duration,

    /// Remote candidates kept while no connection object exists
    pub max_pending_candidates: usize,
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            call_setup_timeout: Duration::from_secs(30),
            max_pending_candidates: 64,
        }
    }
}

/// Call lifecycle of one endpoint
pub struct CallSession<E: MediaEngine> {
    local_id: Option<String>,
    machine: CallStateMachine,
    engine: Arc<E>,
    outbound: mpsc::Sender<Envelope>,
    config: CallSessionConfig,
    media_ready: bool,
    connection_open: bool,
    pending_candidates: VecDeque<IceCandidate>,
    setup_started: Option<Instant>,
}

impl<E: MediaEngine> CallSession<E> {
    pub fn new(engine: Arc<E>, outbound: mpsc::Sender<Envelope>) -> Self {
        Self::with_config(engine, outbound, CallSessionConfig::default())
    }

    pub fn with_config(
        engine: Arc<E>,
        outbound: mpsc::Sender<Envelope>,
        config: CallSessionConfig,
    ) -> Self {
        Self {
            local_id: None,
            machine: CallStateMachine::new(),
            engine,
            outbound,
            config,
            media_ready: false,
            connection_open: false,
            pending_candidates: VecDeque::new(),
            setup_started: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn peer(&self) -> Option<&str> {
        self.machine.peer()
    }

    /// Identifier confirmed by the relay
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Ask the relay to register this endpoint under `id`
    pub async fn register(&mut self, id: &str) -> Result<()> {
        self.send(Envelope::register(id)).await
    }

    /// Place a call: ring the peer, then send our offer
    pub async fn dial(&mut self, target: &str) -> Result<Transition> {
        let transition = self.machine.apply(CallEvent::Dial(target.to_string()))?;
        if !transition.changed() {
            return Ok(transition);
        }
        self.begin_setup();

        info!("Calling {}", target);
        self.send(Envelope::call(target)).await?;

        if let Err(e) = self.send_offer(target).await {
            warn!("Failed to start call to {}: {}", target, e);
            self.end_call(true).await;
            return Err(e);
        }
        Ok(transition)
    }

    /// Accept a ringing call: acquire media and open the connection
    pub async fn accept(&mut self) -> Result<Transition> {
        let transition = self.machine.apply(CallEvent::Accept)?;
        let peer = self.current_peer()?;

        info!("Accepting call from {}", peer);
        if let Err(e) = self.open_connection(&peer).await {
            warn!("Failed to accept call from {}: {}", peer, e);
            self.end_call(true).await;
            return Err(e);
        }
        Ok(transition)
    }

    /// Refuse a ringing call
    pub async fn decline(&mut self) -> Result<()> {
        if self.machine.state() != CallState::Ringing {
            return Err(Error::InvalidTransition(format!(
                "decline not allowed while {}",
                self.machine.state()
            )));
        }
        self.end_call(true).await;
        Ok(())
    }

    /// End the current call, telling the peer; no-op without a call
    pub async fn hangup(&mut self) -> Result<()> {
        self.end_call(true).await;
        Ok(())
    }

    /// Apply one envelope received from the relay
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<CallState> {
        debug!("Session received {}", envelope);

        match envelope {
            Envelope::Registered { id } => {
                info!("Registered as {}", id);
                self.local_id = Some(id);
            }
            Envelope::IncomingCall { from } => self.on_incoming_call(from).await?,
            Envelope::Offer {
                from: Some(from),
                data,
                ..
            } => self.on_offer(from, data).await?,
            Envelope::Answer {
                from: Some(from),
                data,
                ..
            } => {
                self.machine.apply(CallEvent::AnswerReceived(from.clone()))?;
                if let Err(e) = self.engine.set_remote_description(data).await {
                    self.end_call(true).await;
                    return Err(e.into());
                }
            }
            Envelope::IceCandidate {
                from: Some(from),
                data,
                ..
            } => self.on_remote_candidate(from, data).await?,
            Envelope::Hangup {
                from: Some(from), ..
            } => {
                if self.machine.is_active() && self.machine.peer() == Some(from.as_str()) {
                    info!("{} hung up", from);
                    self.end_call(false).await;
                } else {
                    debug!("Ignoring hangup from {} outside its call", from);
                }
            }
            Envelope::RegistrationReplaced { id } => {
                warn!("Identifier {} taken over by another connection", id);
                if self.local_id.as_deref() == Some(id.as_str()) {
                    self.local_id = None;
                }
                self.end_call(false).await;
            }
            Envelope::TargetUnavailable { target, reason } => {
                if self.machine.state() == CallState::Calling
                    && self.machine.peer() == Some(target.as_str())
                {
                    info!("Call to {} not delivered: {:?}", target, reason);
                    self.end_call(false).await;
                }
            }
            other => {
                return Err(Error::MalformedEnvelope(format!(
                    "unexpected {} from relay",
                    other.kind()
                )));
            }
        }

        Ok(self.machine.state())
    }

    /// Apply one event raised by the media engine
    pub async fn handle_media_event(&mut self, event: MediaEvent) -> Result<CallState> {
        match event {
            MediaEvent::LocalIceCandidate(candidate) => {
                let peer = self.current_peer()?;
                self.machine.apply(CallEvent::IceCandidate(peer.clone()))?;
                self.send(Envelope::ice_candidate(peer, candidate)).await?;
            }
            MediaEvent::ConnectionStateChanged(state) => {
                debug!("Peer connection state: {:?}", state);
                match state {
                    PeerConnectionState::Connected => {
                        self.machine.apply(CallEvent::MediaConnected)?;
                        info!("Call connected with {:?}", self.machine.peer());
                    }
                    PeerConnectionState::Failed => {
                        self.finish(CallEvent::MediaFailed).await?;
                    }
                    PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                        self.finish(CallEvent::MediaDisconnected).await?;
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
            }
            MediaEvent::RemoteTrack { kind } => {
                info!("Remote {} track from {:?}", kind, self.machine.peer());
            }
        }
        Ok(self.machine.state())
    }

    /// Abandon a call stuck in `Calling`/`Ringing`. Returns whether it ended.
    pub async fn check_setup_timeout(&mut self, now: Instant) -> Result<bool> {
        let started = match self.setup_started {
            Some(started) if self.machine.is_setup_phase() => started,
            _ => return Ok(false),
        };
        if now.saturating_duration_since(started) < self.config.call_setup_timeout {
            return Ok(false);
        }

        let peer = self.current_peer()?;
        warn!("Call setup with {} timed out", peer);
        self.notify_hangup(&peer).await;
        self.finish(CallEvent::SetupTimeout).await?;
        Ok(true)
    }

    async fn on_incoming_call(&mut self, from: String) -> Result<()> {
        match self.machine.apply(CallEvent::IncomingCall(from.clone())) {
            Ok(transition) => {
                if transition.changed() {
                    info!("Incoming call from {}", from);
                    self.begin_setup();
                }
                Ok(())
            }
            Err(e @ CallError::Busy { .. }) => {
                // Refuse the second caller without touching the current call
                self.notify_hangup(&from).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_offer(&mut self, from: String, data: SessionDescription) -> Result<()> {
        match self.machine.apply(CallEvent::OfferReceived(from.clone())) {
            Ok(_) => {}
            Err(e @ CallError::Busy { .. }) => {
                self.notify_hangup(&from).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.answer_offer(&from, data).await {
            warn!("Failed to answer offer from {}: {}", from, e);
            self.end_call(true).await;
            return Err(e);
        }
        Ok(())
    }

    async fn answer_offer(&mut self, from: &str, data: SessionDescription) -> Result<()> {
        if !self.connection_open {
            self.open_connection(from).await?;
        }
        self.engine.set_remote_description(data).await?;
        let answer = self
            .engine
            .create_local_description(DescriptionRole::Answer)
            .await?;
        self.engine.set_local_description(answer.clone()).await?;
        self.send(Envelope::answer(from, answer)).await?;
        self.machine.apply(CallEvent::AnswerSent(from.to_string()))?;
        Ok(())
    }

    async fn send_offer(&mut self, target: &str) -> Result<()> {
        self.open_connection(target).await?;
        let offer = self
            .engine
            .create_local_description(DescriptionRole::Offer)
            .await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.send(Envelope::offer(target, offer)).await?;
        self.machine.apply(CallEvent::OfferSent(target.to_string()))?;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) -> Result<()> {
        self.machine.apply(CallEvent::IceCandidate(from.clone()))?;

        if self.connection_open {
            self.engine.add_ice_candidate(candidate).await?;
        } else if self.pending_candidates.len() < self.config.max_pending_candidates {
            debug!("Buffering early ICE candidate from {}", from);
            self.pending_candidates.push_back(candidate);
        } else {
            warn!("Dropping ICE candidate from {}: buffer full", from);
        }
        Ok(())
    }

    /// Acquire media if needed, create the connection, flush early candidates
    async fn open_connection(&mut self, peer: &str) -> Result<()> {
        if !self.media_ready {
            self.engine.acquire_local_media().await?;
            self.media_ready = true;
        }
        self.engine.create_connection(peer).await?;
        self.connection_open = true;

        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Drive the machine with a terminal event and release media
    async fn finish(&mut self, event: CallEvent) -> Result<Transition> {
        let transition = self.machine.apply(event)?;
        if transition.ended() {
            self.release().await;
        }
        Ok(transition)
    }

    async fn end_call(&mut self, notify_peer: bool) {
        if !self.machine.is_active() {
            return;
        }
        if notify_peer {
            if let Some(peer) = self.machine.peer().map(str::to_string) {
                self.notify_hangup(&peer).await;
            }
        }
        if let Err(e) = self.finish(CallEvent::Hangup).await {
            warn!("Failed to end call: {}", e);
        }
    }

    async fn release(&mut self) {
        if self.media_ready || self.connection_open {
            if let Err(e) = self.engine.close().await {
                warn!("Media engine failed to close: {}", e);
            }
        }
        self.media_ready = false;
        self.connection_open = false;
        self.pending_candidates.clear();
        self.setup_started = None;
        info!("Call ended with {:?}", self.machine.peer());
    }

    fn begin_setup(&mut self) {
        self.setup_started = Some(Instant::now());
        self.pending_candidates.clear();
    }

    async fn notify_hangup(&self, peer: &str) {
        if let Err(e) = self.send(Envelope::hangup(peer)).await {
            warn!("Failed to send hangup to {}: {}", peer, e);
        }
    }

    fn current_peer(&self) -> Result<String> {
        self.machine
            .peer()
            .filter(|_| self.machine.is_active())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidTransition(format!("no call in progress ({})", self.machine.state()))
            })
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::ChannelClosed("signaling outbound queue".to_string()))
    }
}
