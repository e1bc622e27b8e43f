use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{MediaError, PeerError};
use crate::peer::connection::{PeerEventSink, PeerLink, PeerLinkFactory};
use crate::peer::ice::PendingIceQueue;
use crate::peer::media::{LocalStream, MediaSource};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};

/// The live negotiated transport and the generation it was created for.
pub struct ConnectionHandle {
    pub generation: u64,
    link: Arc<dyn PeerLink>,
    remote_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceDisposition {
    Applied,
    Buffered,
}

/// What a teardown actually released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub closed_connection: bool,
    pub stopped_media: bool,
    pub dropped_candidates: usize,
}

impl TeardownReport {
    pub fn released_anything(&self) -> bool {
        self.closed_connection || self.stopped_media || self.dropped_candidates > 0
    }
}

/// Owns local media and the connection handle for the single live call.
/// Driven exclusively by the call state machine.
pub struct PeerConnectionManager {
    media: Arc<dyn MediaSource>,
    factory: Arc<dyn PeerLinkFactory>,
    ice_servers: Vec<ServerConfig>,
    local_stream: Option<LocalStream>,
    connection: Option<ConnectionHandle>,
    pending_ice: Option<PendingIceQueue>,
}

impl PeerConnectionManager {
    pub fn new(
        media: Arc<dyn MediaSource>,
        factory: Arc<dyn PeerLinkFactory>,
        ice_servers: Vec<ServerConfig>,
    ) -> Self {
        Self {
            media,
            factory,
            ice_servers,
            local_stream: None,
            connection: None,
            pending_ice: None,
        }
    }

    pub fn media_source(&self) -> Arc<dyn MediaSource> {
        self.media.clone()
    }

    /// Granted media is reused until a teardown releases it.
    pub async fn acquire_media(&mut self) -> Result<LocalStream, MediaError> {
        if let Some(stream) = self.cached_media() {
            return Ok(stream);
        }
        let stream = self.media.acquire().await?;
        self.local_stream = Some(stream.clone());
        Ok(stream)
    }

    pub fn cached_media(&self) -> Option<LocalStream> {
        self.local_stream.clone().filter(|s| !s.is_stopped())
    }

    /// Takes ownership of a stream acquired outside the manager.
    pub fn adopt_media(&mut self, stream: LocalStream) {
        if let Some(old) = self.local_stream.replace(stream.clone()) {
            if old.id() != stream.id() {
                old.stop();
            }
        }
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_generation(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.generation)
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.as_ref().map_or(0, PendingIceQueue::len)
    }

    pub async fn create_connection(
        &mut self,
        generation: u64,
        sink: PeerEventSink,
    ) -> Result<(), PeerError> {
        let stream = self.cached_media().ok_or(PeerError::NoMedia)?;
        if let Some(old) = self.connection.take() {
            warn!(old = old.generation, generation, "replacing live connection");
            let _ = old.link.close().await;
        }
        let link = self
            .factory
            .create(&self.ice_servers, &stream, generation, sink)
            .await?;
        self.connection = Some(ConnectionHandle {
            generation,
            link,
            remote_applied: false,
        });
        debug!(generation, pending = self.pending_ice_len(), "connection bound");
        Ok(())
    }

    fn link(&self) -> Result<Arc<dyn PeerLink>, PeerError> {
        self.connection
            .as_ref()
            .map(|c| c.link.clone())
            .ok_or(PeerError::NoConnection)
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.link()?.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.link()?.create_answer().await
    }

    /// Applies the remote description, then flushes buffered candidates.
    pub async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        let link = self.link()?;
        link.set_remote_description(desc).await?;
        if let Some(conn) = self.connection.as_mut() {
            conn.remote_applied = true;
        }
        if let Some(queue) = self.pending_ice.take() {
            let buffered = queue.drain();
            debug!(count = buffered.len(), "applying buffered candidates");
            for candidate in buffered {
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    warn!(error = %e, "buffered candidate rejected");
                }
            }
        }
        Ok(())
    }

    /// Applies `candidate` now if the connection can take it, otherwise
    /// buffers it behind any earlier ones.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<IceDisposition, PeerError> {
        match &self.connection {
            Some(conn) if conn.remote_applied && self.pending_ice.is_none() => {
                conn.link.add_ice_candidate(candidate).await?;
                Ok(IceDisposition::Applied)
            }
            _ => {
                self.pending_ice
                    .get_or_insert_with(PendingIceQueue::default)
                    .push(candidate);
                Ok(IceDisposition::Buffered)
            }
        }
    }

    /// Closes the connection (callbacks silenced first), stops local media
    /// and drops buffered candidates. A second call releases nothing.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.link.close().await {
                warn!(generation = conn.generation, error = %e, "close failed");
            }
            report.closed_connection = true;
        }
        if let Some(stream) = self.local_stream.take() {
            report.stopped_media = stream.stop();
        }
        if let Some(queue) = self.pending_ice.take() {
            report.dropped_candidates = queue.len();
        }
        if report.released_anything() {
            info!(
                closed = report.closed_connection,
                stopped_media = report.stopped_media,
                dropped_candidates = report.dropped_candidates,
                "peer teardown"
            );
        }
        report
    }
}
