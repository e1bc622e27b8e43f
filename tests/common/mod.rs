#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::timeout;

use parley::peer::{
    IceCandidate, LocalStream, MediaSource, PeerEvent, PeerEventKind, PeerEventSink, PeerLink,
    PeerLinkFactory, ServerConfig, SessionDescription,
};
use parley::transport::{MemoryBackend, MemoryRelay, SignalEnvelope, SignalKind};
use parley::{CallState, ClientConfig, Coordinator, CoordinatorEvent, MediaError, PeerError};

// ── media ───────────────────────────────────────────────────────────────────

pub struct FakeMedia {
    deny: Mutex<Option<String>>,
    gate: Option<Semaphore>,
    acquired: AtomicUsize,
    streams: Mutex<Vec<LocalStream>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every `acquire` blocks until `release` hands out a permit.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            deny: Mutex::new(None),
            gate,
            acquired: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn deny(&self, reason: &str) {
        *self.deny.lock() = Some(reason.to_owned());
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<LocalStream> {
        self.streams.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(reason) = self.deny.lock().clone() {
            return Err(MediaError::Denied(reason));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let stream = LocalStream::new(format!("fake-stream-{n}"), Vec::new());
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}

// ── peer links ──────────────────────────────────────────────────────────────

pub struct FakeLink {
    pub generation: u64,
    sink: PeerEventSink,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl FakeLink {
    /// Fires a callback as the transport would, closed or not.
    pub fn emit(&self, kind: PeerEventKind) {
        (self.sink)(PeerEvent {
            generation: self.generation,
            kind,
        });
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(format!("v=0 offer-{}", self.generation)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer(format!("v=0 answer-{}", self.generation)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.remote.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLinks {
    created: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeLinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<FakeLink>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<FakeLink> {
        self.created.lock().last().cloned().expect("a link was created")
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinks {
    async fn create(
        &self,
        _ice_servers: &[ServerConfig],
        _stream: &LocalStream,
        generation: u64,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = Arc::new(FakeLink {
            generation,
            sink,
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.created.lock().push(link.clone());
        Ok(link)
    }
}

// ── parties ─────────────────────────────────────────────────────────────────

pub struct Party {
    pub coord: Coordinator,
    pub id: String,
    pub media: Arc<FakeMedia>,
    pub links: Arc<FakeLinks>,
    pub events: broadcast::Receiver<CoordinatorEvent>,
}

impl Party {
    pub fn state_rx(&self) -> watch::Receiver<CallState> {
        self.coord.call().expect("registered").watch_state()
    }

    pub async fn wait_state(&self, want: CallState) {
        let mut rx = self.state_rx();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
            .expect("call loop alive");
    }

    /// Call states announced so far, in order.
    pub fn drain_states(&mut self) -> Vec<CallState> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            if let CoordinatorEvent::CallStateChanged { state, .. } = ev {
                out.push(state);
            }
        }
        out
    }

    pub fn drain_events(&mut self) -> Vec<CoordinatorEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        ice_servers: Vec::new(),
        ..ClientConfig::default()
    }
}

pub async fn party(
    backend: &MemoryBackend,
    relay: &MemoryRelay,
    name: &str,
    media: Arc<FakeMedia>,
) -> Party {
    let links = FakeLinks::new();
    let coord = Coordinator::new(
        config(),
        Arc::new(backend.clone()),
        Arc::new(relay.clone()),
        media.clone(),
        links.clone(),
    )
    .expect("valid config");
    let events = coord.subscribe();
    let identity = coord.register(name).await.expect("register");
    Party {
        coord,
        id: identity.id,
        media,
        links,
        events,
    }
}

pub async fn connected_party(
    backend: &MemoryBackend,
    relay: &MemoryRelay,
    name: &str,
    media: Arc<FakeMedia>,
) -> Party {
    let p = party(backend, relay, name, media).await;
    p.coord.connect_signaling().await.expect("signaling");
    p
}

/// Gives spawned tasks a chance to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn kinds_from(relay: &MemoryRelay, from: &str) -> Vec<SignalKind> {
    relay
        .routed()
        .into_iter()
        .filter(|e| e.from == from)
        .map(|e| e.kind)
        .collect()
}

pub fn routed_to(relay: &MemoryRelay, to: &str) -> Vec<SignalEnvelope> {
    relay.routed().into_iter().filter(|e| e.to == to).collect()
}

pub fn candidate(s: &str) -> IceCandidate {
    IceCandidate {
        candidate: s.to_owned(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
