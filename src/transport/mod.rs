//! Boundary to the backend collaborator: a request/response channel for
//! register / session / send / poll, and a bidirectional signaling channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{NetworkError, RegisterError, SendError, SessionError, SignalingError};
use crate::types::Identity;

pub mod http;
pub mod memory;
pub mod wire;
pub mod ws;

pub use http::HttpBackend;
pub use memory::{MemoryBackend, MemoryRelay};
pub use wire::{InboundMessage, SignalEnvelope, SignalKind};
pub use ws::WsConnector;

#[async_trait]
pub trait Backend: Send + Sync {
    async fn health(&self) -> Result<(), NetworkError>;

    /// Registers `username` and returns the issued user id.
    async fn register(&self, username: &str) -> Result<String, RegisterError>;

    async fn init_session(&self, sender_id: &str, receiver_id: &str) -> Result<(), SessionError>;

    async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<(), SendError>;

    /// Drains the queued messages for `user_id`, in queue order.
    async fn poll(&self, user_id: &str) -> Result<Vec<InboundMessage>, NetworkError>;
}

/// Item read from the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalInbound {
    Envelope(SignalEnvelope),
    Malformed(String),
    Closed,
}

/// An attached signaling channel. Dropping `outbound` closes the writer.
#[derive(Debug)]
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<SignalEnvelope>,
    pub inbound: mpsc::UnboundedReceiver<SignalInbound>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Opens the per-identity channel, addressed by the identity id.
    async fn connect(&self, identity: &Identity) -> Result<SignalingLink, SignalingError>;
}
