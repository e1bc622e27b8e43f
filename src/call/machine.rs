use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::call::state::{CallDirection, CallSession, CallState};
use crate::error::{CallError, MediaError, PeerError, SignalingError};
use crate::events::{CoordinatorEvent, EventSink};
use crate::peer::connection::PeerEventSink;
use crate::peer::manager::PeerConnectionManager;
use crate::peer::media::LocalStream;
use crate::peer::types::{LinkState, PeerEvent, PeerEventKind, SessionDescription};
use crate::transport::{SignalEnvelope, SignalKind};

/// Everything that can affect the call, funnelled through one queue and
/// handled strictly in arrival order.
#[derive(Debug)]
pub enum CallInput {
    Start {
        peer: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        reply: Option<oneshot::Sender<bool>>,
    },
    Attach {
        link: u64,
        outbound: mpsc::UnboundedSender<SignalEnvelope>,
    },
    Signal {
        link: u64,
        envelope: SignalEnvelope,
    },
    SignalingClosed {
        link: u64,
    },
    MediaReady {
        generation: u64,
        result: Result<LocalStream, MediaError>,
    },
    Peer(PeerEvent),
    Shutdown,
}

struct Attachment {
    link: u64,
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
}

/// Owns the call state. Only `handle` mutates it.
pub struct CallStateMachine {
    local_id: String,
    state: CallState,
    session: Option<CallSession>,
    generation: u64,
    peers: PeerConnectionManager,
    attachment: Option<Attachment>,
    inputs: mpsc::UnboundedSender<CallInput>,
    events: EventSink,
    state_tx: watch::Sender<CallState>,
}

impl CallStateMachine {
    pub fn new(
        local_id: impl Into<String>,
        peers: PeerConnectionManager,
        inputs: mpsc::UnboundedSender<CallInput>,
        events: EventSink,
        state_tx: watch::Sender<CallState>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            state: CallState::Idle,
            session: None,
            generation: 0,
            peers,
            attachment: None,
            inputs,
            events,
            state_tx,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Handles one input. Returns `false` once the loop should stop.
    pub async fn handle(&mut self, input: CallInput) -> bool {
        match input {
            CallInput::Start { peer, reply } => {
                let result = self.start(&peer);
                let _ = reply.send(result);
            }
            CallInput::Hangup { reply } => {
                let ended = self.hangup().await;
                if let Some(reply) = reply {
                    let _ = reply.send(ended);
                }
            }
            CallInput::Attach { link, outbound } => {
                debug!(link, "signaling attached");
                self.attachment = Some(Attachment { link, outbound });
            }
            CallInput::Signal { link, envelope } => {
                if self.attachment.as_ref().map(|a| a.link) != Some(link) {
                    debug!(link, kind = %envelope.kind, "signal from detached link dropped");
                    return true;
                }
                if let Err(e) = self.on_signal(envelope).await {
                    warn!(error = %e, "signal dropped");
                }
            }
            CallInput::SignalingClosed { link } => {
                if self.attachment.as_ref().map(|a| a.link) == Some(link) {
                    self.attachment = None;
                    if self.state.is_active() {
                        info!("signaling closed during call");
                        self.end_call(false).await;
                    }
                    self.events.emit(CoordinatorEvent::SignalingClosed);
                }
            }
            CallInput::MediaReady { generation, result } => {
                self.on_media_ready(generation, result).await;
            }
            CallInput::Peer(event) => self.on_peer_event(event).await,
            CallInput::Shutdown => {
                if self.state.is_active() {
                    self.end_call(true).await;
                }
                self.peers.teardown().await;
                return false;
            }
        }
        true
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, peer = ?self.peer_id(), "call state");
        self.state = next;
        self.state_tx.send_replace(next);
        self.events.emit(CoordinatorEvent::CallStateChanged {
            peer: self.peer_id().map(str::to_owned),
            state: next,
        });
    }

    fn peer_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.peer_id.as_str())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn send(&self, envelope: SignalEnvelope) {
        match &self.attachment {
            Some(a) => {
                debug!(kind = %envelope.kind, to = %envelope.to, "signal out");
                if a.outbound.send(envelope).is_err() {
                    warn!("signaling writer gone");
                }
            }
            None => warn!(kind = %envelope.kind, "no signaling channel, signal not sent"),
        }
    }

    fn start(&mut self, peer: &str) -> Result<(), CallError> {
        if self.attachment.is_none() {
            return Err(CallError::NotAttached);
        }
        if peer.is_empty() || peer == self.local_id {
            return Err(CallError::InvalidPeer(peer.to_owned()));
        }
        if self.state != CallState::Idle {
            return Err(CallError::Busy);
        }
        self.generation += 1;
        self.session = Some(CallSession::new(
            peer,
            CallDirection::Outgoing,
            self.generation,
        ));
        self.set_state(CallState::AwaitingMedia);
        self.request_media(self.generation);
        Ok(())
    }

    /// Media is acquired off the loop; the result comes back as
    /// `MediaReady` tagged with the generation that asked for it.
    fn request_media(&self, generation: u64) {
        let inputs = self.inputs.clone();
        if let Some(stream) = self.peers.cached_media() {
            let _ = inputs.send(CallInput::MediaReady {
                generation,
                result: Ok(stream),
            });
            return;
        }
        let media = self.peers.media_source();
        tokio::spawn(async move {
            let result = media.acquire().await;
            let _ = inputs.send(CallInput::MediaReady { generation, result });
        });
    }

    fn peer_sink(&self) -> PeerEventSink {
        let inputs = self.inputs.clone();
        Arc::new(move |event: PeerEvent| {
            let _ = inputs.send(CallInput::Peer(event));
        })
    }

    async fn on_media_ready(&mut self, generation: u64, result: Result<LocalStream, MediaError>) {
        if !self.is_current(generation) {
            debug!(generation, "stale media result");
            if let Ok(stream) = result {
                let held = self
                    .peers
                    .cached_media()
                    .is_some_and(|s| s.id() == stream.id());
                if !held {
                    stream.stop();
                }
            }
            return;
        }
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "media acquisition failed");
                self.events.emit(CoordinatorEvent::MediaError(e.to_string()));
                self.abort_call().await;
                return;
            }
        };
        self.peers.adopt_media(stream.clone());
        self.events.emit(CoordinatorEvent::LocalMediaReady {
            stream_id: stream.id().to_owned(),
        });
        if let Err(e) = self.negotiate(generation).await {
            warn!(error = %e, "negotiation setup failed");
            self.abort_call().await;
        }
    }

    async fn negotiate(&mut self, generation: u64) -> Result<(), PeerError> {
        let sink = self.peer_sink();
        self.peers.create_connection(generation, sink).await?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let peer = session.peer_id.clone();
        match session.direction {
            CallDirection::Outgoing => {
                let offer = self.peers.create_offer().await?;
                self.send(SignalEnvelope::offer(&self.local_id, &peer, &offer));
                self.set_state(CallState::Negotiating);
            }
            CallDirection::Incoming => {
                let offer = session
                    .pending_offer
                    .take()
                    .ok_or_else(|| PeerError::InvalidDescription("no pending offer".into()))?;
                self.answer(&peer, offer).await?;
            }
        }
        Ok(())
    }

    async fn answer(&mut self, peer: &str, offer: SessionDescription) -> Result<(), PeerError> {
        self.peers.apply_remote(offer).await?;
        let answer = self.peers.create_answer().await?;
        self.send(SignalEnvelope::answer(&self.local_id, peer, &answer));
        Ok(())
    }

    /// Drops a call that never got going. Only an incoming caller is told,
    /// since only they are waiting on us.
    async fn abort_call(&mut self) {
        let session = self.session.take();
        self.peers.teardown().await;
        if let Some(s) = &session {
            if s.direction == CallDirection::Incoming {
                self.send(SignalEnvelope::hangup(&self.local_id, &s.peer_id));
            }
        }
        self.set_state(CallState::Idle);
    }

    async fn hangup(&mut self) -> bool {
        if !self.state.is_active() {
            debug!(state = %self.state, "hangup with no live call");
            return false;
        }
        self.end_call(true).await;
        true
    }

    /// `Ending -> Ended -> Idle`, releasing the connection and media. The
    /// peer is only told if it has heard of the call.
    async fn end_call(&mut self, notify_peer: bool) {
        // AwaitingMedia is outgoing-only and precedes the offer
        let peer_knows = self.state != CallState::AwaitingMedia;
        self.set_state(CallState::Ending);
        let report = self.peers.teardown().await;
        debug!(?report, "call resources released");
        if notify_peer && peer_knows {
            if let Some(peer) = self.peer_id().map(str::to_owned) {
                self.send(SignalEnvelope::hangup(&self.local_id, &peer));
            }
        }
        self.set_state(CallState::Ended);
        self.session = None;
        self.set_state(CallState::Idle);
    }

    fn from_current_peer(&self, from: &str) -> bool {
        self.peer_id() == Some(from)
    }

    async fn on_signal(&mut self, env: SignalEnvelope) -> Result<(), SignalingError> {
        if !env.to.is_empty() && env.to != self.local_id {
            return Err(SignalingError::UnexpectedPeer(env.to));
        }
        debug!(kind = %env.kind, from = %env.from, state = %self.state, "signal in");
        match env.kind {
            SignalKind::Offer => self.on_offer(env).await,
            SignalKind::Answer => self.on_answer(env).await,
            SignalKind::Ice => self.on_ice(env).await,
            SignalKind::Hangup => {
                if self.state.is_active() && self.from_current_peer(&env.from) {
                    self.end_call(false).await;
                } else {
                    debug!(from = %env.from, "hangup for no live call ignored");
                }
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, env: SignalEnvelope) -> Result<(), SignalingError> {
        let offer = env.description()?;
        let from = env.from;
        if self.state == CallState::Idle {
            self.generation += 1;
            let mut session = CallSession::new(&from, CallDirection::Incoming, self.generation);
            session.pending_offer = Some(offer);
            self.session = Some(session);
            self.events
                .emit(CoordinatorEvent::IncomingCall { from: from.clone() });
            self.set_state(CallState::Negotiating);
            self.request_media(self.generation);
            return Ok(());
        }

        let same_peer = self.from_current_peer(&from);
        let direction = self.session.as_ref().map(|s| s.direction);
        let renegotiation = same_peer
            && (self.state == CallState::Connected
                || (self.state == CallState::Negotiating
                    && direction == Some(CallDirection::Incoming)));
        if renegotiation {
            if self.peers.has_connection() {
                info!(peer = %from, "renegotiation");
                if let Err(e) = self.answer(&from, offer).await {
                    warn!(error = %e, "renegotiation failed");
                }
            } else if let Some(session) = self.session.as_mut() {
                // still waiting for media: answer the latest offer
                session.pending_offer = Some(offer);
            }
            return Ok(());
        }

        let reason = if same_peer { "glare" } else { "busy" };
        warn!(from = %from, state = %self.state, reason, "offer rejected");
        self.events.emit(CoordinatorEvent::CallRejected {
            from: from.clone(),
            reason: reason.to_owned(),
        });
        if !same_peer {
            self.send(SignalEnvelope::hangup(&self.local_id, &from));
        }
        Ok(())
    }

    async fn on_answer(&mut self, env: SignalEnvelope) -> Result<(), SignalingError> {
        let expecting = self.state == CallState::Negotiating
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.direction == CallDirection::Outgoing);
        if !expecting {
            return Err(SignalingError::OutOfState {
                kind: env.kind.to_string(),
                state: self.state,
            });
        }
        if !self.from_current_peer(&env.from) {
            return Err(SignalingError::UnexpectedPeer(env.from));
        }
        let answer = env.description()?;
        match self.peers.apply_remote(answer).await {
            Ok(()) => self.set_state(CallState::Connected),
            Err(e) => {
                warn!(error = %e, "remote answer unusable, ending call");
                self.end_call(true).await;
            }
        }
        Ok(())
    }

    async fn on_ice(&mut self, env: SignalEnvelope) -> Result<(), SignalingError> {
        let candidate = env.candidate()?;
        if !matches!(self.state, CallState::Negotiating | CallState::Connected) {
            debug!(state = %self.state, "candidate outside a call discarded");
            return Ok(());
        }
        if !self.from_current_peer(&env.from) {
            return Err(SignalingError::UnexpectedPeer(env.from));
        }
        match self.peers.add_remote_candidate(candidate).await {
            Ok(disposition) => debug!(?disposition, "remote candidate"),
            Err(e) => warn!(error = %e, "remote candidate rejected"),
        }
        Ok(())
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        if !self.is_current(event.generation)
            || self.peers.connection_generation() != Some(event.generation)
        {
            debug!(generation = event.generation, "late peer event dropped");
            return;
        }
        let Some(peer) = self.peer_id().map(str::to_owned) else {
            return;
        };
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.send(SignalEnvelope::ice(&self.local_id, &peer, &candidate));
            }
            PeerEventKind::GatheringComplete => debug!("local gathering complete"),
            PeerEventKind::RemoteTrack { kind, track_id } => {
                info!(%kind, %track_id, "remote track");
                self.events.emit(CoordinatorEvent::RemoteTrack {
                    peer,
                    kind,
                    track_id,
                });
            }
            PeerEventKind::StateChanged(link_state) => {
                self.events
                    .emit(CoordinatorEvent::ConnectionState(link_state));
                if link_state.is_terminal() {
                    info!(?link_state, "connection lost, ending call");
                    self.end_call(false).await;
                } else if link_state == LinkState::Connected
                    && self.state == CallState::Negotiating
                {
                    self.set_state(CallState::Connected);
                }
            }
        }
    }
}

/// Drains the queue until `Shutdown`.
pub async fn run(mut machine: CallStateMachine, mut inputs: mpsc::UnboundedReceiver<CallInput>) {
    while let Some(input) = inputs.recv().await {
        if !machine.handle(input).await {
            break;
        }
    }
    debug!(local_id = %machine.local_id, "call loop finished");
}
