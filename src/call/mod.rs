//! Call signaling: one call slot, driven by a single input queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::events::{CoordinatorEvent, EventSink};
use crate::peer::manager::PeerConnectionManager;
use crate::transport::{SignalInbound, SignalingLink};

pub mod machine;
pub mod state;

pub use machine::{CallInput, CallStateMachine};
pub use state::{CallDirection, CallSession, CallState};

/// Cloneable front door to a running call loop.
#[derive(Clone)]
pub struct CallHandle {
    inputs: mpsc::UnboundedSender<CallInput>,
    state: watch::Receiver<CallState>,
    links: Arc<AtomicU64>,
}

impl CallHandle {
    /// Spawns the loop for `local_id` on the current runtime.
    pub fn spawn(
        local_id: &str,
        peers: PeerConnectionManager,
        events: EventSink,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let machine = CallStateMachine::new(local_id, peers, tx.clone(), events, state_tx);
        let task = tokio::spawn(machine::run(machine, rx));
        (
            Self {
                inputs: tx,
                state: state_rx,
                links: Arc::new(AtomicU64::new(0)),
            },
            task,
        )
    }

    fn post(&self, input: CallInput) -> Result<(), CallError> {
        self.inputs.send(input).map_err(|_| CallError::Stopped)
    }

    pub async fn start_call(&self, peer: &str) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.post(CallInput::Start {
            peer: peer.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Ends the live call. `Ok(false)` when there was none.
    pub async fn hangup(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.post(CallInput::Hangup { reply: Some(reply) })?;
        rx.await.map_err(|_| CallError::Stopped)
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Hands a fresh signaling link to the loop. Inbound items are forwarded
    /// in order until the link closes; a later attach supersedes this one.
    pub fn attach(&self, link: SignalingLink, events: &EventSink) -> Result<u64, CallError> {
        let id = self.links.fetch_add(1, Ordering::SeqCst) + 1;
        let SignalingLink {
            outbound,
            mut inbound,
        } = link;
        self.post(CallInput::Attach { link: id, outbound })?;
        events.emit(CoordinatorEvent::SignalingConnected);

        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                let input = match item {
                    SignalInbound::Envelope(envelope) => CallInput::Signal { link: id, envelope },
                    SignalInbound::Malformed(reason) => {
                        warn!(link = id, %reason, "malformed signal dropped");
                        continue;
                    }
                    SignalInbound::Closed => break,
                };
                if inputs.send(input).is_err() {
                    return;
                }
            }
            debug!(link = id, "signaling link ended");
            let _ = inputs.send(CallInput::SignalingClosed { link: id });
        });
        Ok(id)
    }

    pub fn shutdown(&self) {
        let _ = self.inputs.send(CallInput::Shutdown);
    }
}
