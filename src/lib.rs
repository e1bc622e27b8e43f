//! Session and call coordination for a relay-backed messenger: secure
//! session bookkeeping, polled chat delivery, and a single audio/video call
//! negotiated over a signaling relay.

pub mod call;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logger;
pub mod messaging;
pub mod peer;
pub mod session;
pub mod transport;
pub mod types;
pub mod utils;

pub use call::{CallDirection, CallHandle, CallState};
pub use config::{ClientConfig, ConfigError, LogConfig};
pub use coordinator::Coordinator;
pub use error::{
    CallError, CoordinatorError, MediaError, NetworkError, PeerError, RegisterError, SendError,
    SessionError, SignalingError,
};
pub use events::{CoordinatorEvent, EventSink};
pub use messaging::MessagePipeline;
pub use session::{SessionManager, SessionState};
pub use types::{Ack, ChatMessage, Identity, PeerSession};
