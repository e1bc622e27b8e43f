use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered party. Issued by the backend, immutable afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

/// Established secure-messaging session between two identities.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub local_id: String,
    pub remote_id: String,
    pub established: bool,
    pub established_at: DateTime<Utc>,
}

/// Unordered identity pair keying the session map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(String, String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            PairKey(a.to_owned(), b.to_owned())
        } else {
            PairKey(b.to_owned(), a.to_owned())
        }
    }
}

/// A chat message as surfaced to the consumer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub sequence_hint: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub dedup_key: String,
}

/// Acknowledgement of a delivered send, with the local echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub message: ChatMessage,
    pub sent_at: DateTime<Utc>,
}
