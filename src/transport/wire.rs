use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};

// ── Signaling envelope ──────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::Hangup => "hangup",
        };
        f.write_str(name)
    }
}

/// `{type, from, to, data}` as relayed verbatim by the signaling server,
/// which routes on `to` only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub data: Value,
}

impl SignalEnvelope {
    pub fn offer(from: &str, to: &str, desc: &SessionDescription) -> Self {
        Self::with_data(SignalKind::Offer, from, to, desc)
    }

    pub fn answer(from: &str, to: &str, desc: &SessionDescription) -> Self {
        Self::with_data(SignalKind::Answer, from, to, desc)
    }

    pub fn ice(from: &str, to: &str, candidate: &IceCandidate) -> Self {
        Self::with_data(SignalKind::Ice, from, to, candidate)
    }

    pub fn hangup(from: &str, to: &str) -> Self {
        Self {
            kind: SignalKind::Hangup,
            from: from.to_owned(),
            to: to.to_owned(),
            data: Value::Null,
        }
    }

    fn with_data(kind: SignalKind, from: &str, to: &str, data: &impl Serialize) -> Self {
        Self {
            kind,
            from: from.to_owned(),
            to: to.to_owned(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// Session description carried by an offer/answer. Accepts the
    /// description at the top of `data` or nested under `data.sdp`.
    pub fn description(&self) -> Result<SessionDescription, SignalingError> {
        let expected = match self.kind {
            SignalKind::Offer => SdpKind::Offer,
            SignalKind::Answer => SdpKind::Answer,
            other => {
                return Err(SignalingError::Malformed(format!(
                    "{other} does not carry a session description"
                )))
            }
        };
        let raw = match self.data.get("sdp") {
            Some(inner @ Value::Object(_)) => inner.clone(),
            _ => self.data.clone(),
        };
        let desc: SessionDescription = serde_json::from_value(raw)
            .map_err(|e| SignalingError::Malformed(format!("{} data: {e}", self.kind)))?;
        if desc.kind != expected {
            return Err(SignalingError::Malformed(format!(
                "{} envelope carries a {:?} description",
                self.kind, desc.kind
            )));
        }
        if desc.sdp.trim().is_empty() {
            return Err(SignalingError::Malformed(format!("{} with empty sdp", self.kind)));
        }
        Ok(desc)
    }

    /// Candidate carried by an `ice` envelope, at the top of `data` or
    /// nested under `data.candidate`.
    pub fn candidate(&self) -> Result<IceCandidate, SignalingError> {
        if self.kind != SignalKind::Ice {
            return Err(SignalingError::Malformed(format!(
                "{} does not carry a candidate",
                self.kind
            )));
        }
        let raw = match self.data.get("candidate") {
            Some(inner @ Value::Object(_)) => inner.clone(),
            _ => self.data.clone(),
        };
        serde_json::from_value(raw).map_err(|e| SignalingError::Malformed(format!("ice data: {e}")))
    }
}

// ── Backend request / response bodies ───────────────────────────────────────

#[derive(Serialize, Debug)]
pub(crate) struct RegisterRequest<'a> {
    pub username: &'a str,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RegisterResponse {
    pub user_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize, Debug)]
pub(crate) struct SessionInitRequest<'a> {
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
}

#[derive(Serialize, Debug)]
pub(crate) struct SendRequest<'a> {
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
    pub text: &'a str,
}

/// `{status}` on success, `{error}` on application failure; the backend
/// answers both with HTTP 200.
#[derive(Deserialize, Debug)]
pub(crate) struct StatusResponse {
    pub status: Option<String>,
    pub error: Option<String>,
    pub used_one_time_prekey: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct PollResponse {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

/// One queued message as returned by a poll.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl InboundMessage {
    pub fn new(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_name: None,
            text: text.into(),
            id: None,
        }
    }
}
