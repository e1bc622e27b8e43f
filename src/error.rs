use thiserror::Error;

use crate::call::state::CallState;
use crate::config::ConfigError;

/// Transport unreachable or answered outside 2xx. Never fatal: the attempt
/// that hit it is abandoned, nothing else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected status: {status} body={body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            NetworkError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            NetworkError::Status {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            NetworkError::Unreachable(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("registration refused: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session establishment rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("no identity registered")]
    NotRegistered,

    #[error("cannot open a session with yourself")]
    SelfSession,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("no established session with this peer")]
    NoSession,

    #[error("backend refused the message: {0}")]
    Rejected(String),

    #[error("message text is empty")]
    EmptyMessage,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    Denied(String),

    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("no local media bound to the call")]
    NoMedia,

    #[error("no peer connection for the call")]
    NoConnection,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,

    #[error("signaling channel is not attached")]
    NotAttached,

    #[error("invalid call target: {0}")]
    InvalidPeer(String),

    #[error("call loop stopped")]
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(String),

    #[error("malformed signaling message: {0}")]
    Malformed(String),

    #[error("{kind} not valid in state {state:?}")]
    OutOfState { kind: String, state: CallState },

    #[error("signal from {0} does not belong to the live call")]
    UnexpectedPeer(String),

    #[error("signaling channel closed")]
    Closed,
}

/// Errors surfaced by the [`Coordinator`](crate::Coordinator) façade.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("no identity registered")]
    NotRegistered,

    #[error("no peer selected")]
    NoPeerSelected,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
