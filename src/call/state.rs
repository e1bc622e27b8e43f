use std::fmt;

use chrono::{DateTime, Utc};

use crate::peer::types::SessionDescription;

/// Logical state of the single call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    AwaitingMedia,
    /// Local offer sent, or remote offer received and answer pending.
    Negotiating,
    Connected,
    Ending,
    Ended,
}

impl CallState {
    /// States a hangup can act on.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallState::AwaitingMedia | CallState::Negotiating | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub peer_id: String,
    pub direction: CallDirection,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    /// Remote offer waiting for local media before it can be answered.
    pub(crate) pending_offer: Option<SessionDescription>,
}

impl CallSession {
    pub(crate) fn new(peer_id: &str, direction: CallDirection, generation: u64) -> Self {
        Self {
            peer_id: peer_id.to_owned(),
            direction,
            generation,
            started_at: Utc::now(),
            pending_offer: None,
        }
    }
}
