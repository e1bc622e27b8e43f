//! Notifications for the presentation layer.
//!
//! Everything the UI needs to render (call state, media availability,
//! failures worth a toast) is emitted here. Emission never blocks and never
//! fails; events sent while nobody listens are dropped.

use tokio::sync::broadcast;
use tracing::trace;

use crate::call::state::CallState;
use crate::peer::types::LinkState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    SignalingConnected,
    SignalingClosed,
    SignalingFailed(String),
    CallStateChanged {
        peer: Option<String>,
        state: CallState,
    },
    IncomingCall {
        from: String,
    },
    CallRejected {
        from: String,
        reason: String,
    },
    LocalMediaReady {
        stream_id: String,
    },
    RemoteTrack {
        peer: String,
        kind: String,
        track_id: String,
    },
    ConnectionState(LinkState),
    MediaError(String),
    PollFailed(String),
    MessagesReceived {
        count: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }
}
