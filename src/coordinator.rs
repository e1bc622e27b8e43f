//! The one object a presentation layer talks to.
//!
//! Holds the identity, the session map, the message pipeline and the call
//! loop. Nothing here is global; build one per logged-in run.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::info;

use crate::call::{CallHandle, CallState};
use crate::config::ClientConfig;
use crate::error::{CallError, CoordinatorError, SendError};
use crate::events::{CoordinatorEvent, EventSink};
use crate::logger;
use crate::messaging::MessagePipeline;
use crate::peer::{MediaSource, PeerConnectionManager, PeerLinkFactory, RtcPeerLinkFactory, TrackMediaSource};
use crate::session::{SessionManager, SessionState};
use crate::transport::{Backend, HttpBackend, SignalingConnector, WsConnector};
use crate::types::{Ack, ChatMessage, Identity, PeerSession};

pub struct Coordinator {
    config: ClientConfig,
    backend: Arc<dyn Backend>,
    connector: Arc<dyn SignalingConnector>,
    media: Arc<dyn MediaSource>,
    links: Arc<dyn PeerLinkFactory>,
    events: EventSink,
    sessions: SessionManager,
    pipeline: MessagePipeline,
    identity: RwLock<Option<Identity>>,
    current_peer: Mutex<Option<String>>,
    call: Mutex<Option<CallHandle>>,
}

impl Coordinator {
    /// Fails when `config` does not validate.
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn Backend>,
        connector: Arc<dyn SignalingConnector>,
        media: Arc<dyn MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let events = EventSink::new();
        Ok(Self {
            sessions: SessionManager::new(backend.clone()),
            pipeline: MessagePipeline::new(backend.clone(), events.clone(), &config),
            config,
            backend,
            connector,
            media,
            links,
            events,
            identity: RwLock::new(None),
            current_peer: Mutex::new(None),
            call: Mutex::new(None),
        })
    }

    /// HTTP backend, WebSocket signaling and webrtc-rs peers. Installs the
    /// tracing subscriber when logging is enabled.
    pub fn from_config(config: ClientConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        logger::init(&config.log);
        let backend = Arc::new(HttpBackend::new(&config)?);
        let connector = Arc::new(WsConnector::from_config(&config)?);
        let links = Arc::new(RtcPeerLinkFactory::new()?);
        Self::new(
            config,
            backend,
            connector,
            Arc::new(TrackMediaSource::default()),
            links,
        )
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub async fn check_backend(&self) -> Result<(), CoordinatorError> {
        Ok(self.backend.health().await?)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    fn require_identity(&self) -> Result<Identity, CoordinatorError> {
        self.identity().ok_or(CoordinatorError::NotRegistered)
    }

    fn call_handle(&self) -> Result<CallHandle, CoordinatorError> {
        self.call
            .lock()
            .clone()
            .ok_or(CoordinatorError::NotRegistered)
    }

    /// Registers `username`. A new identity drops every session, poll loop
    /// and call that belonged to the previous one.
    pub async fn register(&self, username: &str) -> Result<Identity, CoordinatorError> {
        let user_id = self.backend.register(username).await?;
        let identity = Identity {
            id: user_id,
            display_name: username.to_owned(),
        };
        self.release_identity();

        let peers = PeerConnectionManager::new(
            self.media.clone(),
            self.links.clone(),
            self.config.ice_servers.clone(),
        );
        let (handle, _task) = CallHandle::spawn(&identity.id, peers, self.events.clone());
        *self.call.lock() = Some(handle);
        *self.identity.write() = Some(identity.clone());
        info!(user_id = %identity.id, name = %identity.display_name, "registered");
        Ok(identity)
    }

    fn release_identity(&self) {
        let previous = self.identity.write().take();
        if let Some(old) = previous {
            info!(user_id = %old.id, "dropping previous identity");
            self.pipeline.stop_polling(&old.id);
        }
        self.sessions.reset();
        *self.current_peer.lock() = None;
        if let Some(call) = self.call.lock().take() {
            call.shutdown();
        }
    }

    /// Switches the chat partner. The previous partner's session is torn
    /// down, never reused.
    pub async fn select_peer(&self, remote_id: &str) -> Result<PeerSession, CoordinatorError> {
        let local = self.require_identity()?;
        let previous = self.current_peer.lock().replace(remote_id.to_owned());
        if let Some(prev) = previous.filter(|p| p != remote_id) {
            self.sessions.teardown(&local.id, &prev);
        }
        Ok(self.sessions.ensure_session(&local.id, remote_id).await?)
    }

    pub fn current_peer(&self) -> Option<String> {
        self.current_peer.lock().clone()
    }

    pub async fn ensure_session(&self, remote_id: &str) -> Result<PeerSession, CoordinatorError> {
        let local = self.require_identity()?;
        Ok(self.sessions.ensure_session(&local.id, remote_id).await?)
    }

    pub fn session_state(&self, remote_id: &str) -> Result<SessionState, CoordinatorError> {
        let local = self.require_identity()?;
        Ok(self.sessions.session_state(&local.id, remote_id))
    }

    /// Sends to the selected peer.
    pub async fn send(&self, text: &str) -> Result<Ack, CoordinatorError> {
        let peer = self.current_peer().ok_or(CoordinatorError::NoPeerSelected)?;
        self.send_to(&peer, text).await
    }

    pub async fn send_to(&self, remote_id: &str, text: &str) -> Result<Ack, CoordinatorError> {
        let local = self.require_identity()?;
        let session = self
            .sessions
            .get(&local.id, remote_id)
            .ok_or(SendError::NoSession)?;
        Ok(self.pipeline.send(&local, &session, text).await?)
    }

    pub async fn poll_once(&self) -> Result<Vec<ChatMessage>, CoordinatorError> {
        let local = self.require_identity()?;
        Ok(self.pipeline.poll_once(&local).await)
    }

    pub fn start_polling<F>(&self, on_batch: F) -> Result<(), CoordinatorError>
    where
        F: Fn(Vec<ChatMessage>) + Send + Sync + 'static,
    {
        let local = self.require_identity()?;
        self.pipeline
            .start_polling(&local, self.config.poll_interval(), on_batch)?;
        Ok(())
    }

    pub fn stop_polling(&self) -> bool {
        self.identity()
            .is_some_and(|local| self.pipeline.stop_polling(&local.id))
    }

    pub fn is_polling(&self) -> bool {
        self.identity()
            .is_some_and(|local| self.pipeline.is_polling(&local.id))
    }

    /// Opens the signaling channel for the current identity. Failure is
    /// reported and retryable; call state is untouched either way.
    pub async fn connect_signaling(&self) -> Result<(), CoordinatorError> {
        let local = self.require_identity()?;
        let call = self.call_handle()?;
        match self.connector.connect(&local).await {
            Ok(link) => {
                let id = call.attach(link, &self.events)?;
                info!(user_id = %local.id, link = id, "signaling connected");
                Ok(())
            }
            Err(e) => {
                self.events
                    .emit(CoordinatorEvent::SignalingFailed(e.to_string()));
                Err(e.into())
            }
        }
    }

    pub async fn start_call(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        Ok(self.call_handle()?.start_call(peer_id).await?)
    }

    /// `Ok(false)` when no call was live.
    pub async fn hangup(&self) -> Result<bool, CoordinatorError> {
        Ok(self.call_handle()?.hangup().await?)
    }

    pub fn call_state(&self) -> CallState {
        self.call
            .lock()
            .as_ref()
            .map_or(CallState::Idle, CallHandle::state)
    }

    pub fn call(&self) -> Result<CallHandle, CallError> {
        self.call.lock().clone().ok_or(CallError::Stopped)
    }

    /// Stops polling, ends any call and forgets the identity.
    pub fn shutdown(&self) {
        self.pipeline.stop_all();
        self.release_identity();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(call) = self.call.lock().take() {
            call.shutdown();
        }
    }
}
