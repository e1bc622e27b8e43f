use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::wire::{
    InboundMessage, PollResponse, RegisterRequest, RegisterResponse, SendRequest,
    SessionInitRequest, StatusResponse,
};
use super::Backend;
use crate::config::ClientConfig;
use crate::error::{NetworkError, RegisterError, SendError, SessionError};

/// JSON-over-HTTP adapter for the backend collaborator.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, NetworkError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| NetworkError::Unreachable(format!("http client setup: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.clone(),
        })
    }

    /// Appends `segments` to the base path. Each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, NetworkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| NetworkError::Unreachable(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Non-2xx becomes `NetworkError::Status`; a 2xx body is decoded as `T`.
async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, NetworkError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(NetworkError::Status {
            status: status.as_u16(),
            body,
        });
    }
    res.json::<T>()
        .await
        .map_err(|e| NetworkError::Decode(e.to_string()))
}

fn is_established(status: &str) -> bool {
    matches!(status, "established" | "session_established")
}

#[async_trait]
impl Backend for HttpBackend {
    async fn health(&self) -> Result<(), NetworkError> {
        let res = self.http.get(self.endpoint(&["health"])?).send().await?;
        let body: StatusResponse = decode(res).await?;
        match body.status.as_deref() {
            Some("ok") => Ok(()),
            other => Err(NetworkError::Decode(format!("unexpected health status {other:?}"))),
        }
    }

    async fn register(&self, username: &str) -> Result<String, RegisterError> {
        let res = self
            .http
            .post(self.endpoint(&["register"])?)
            .json(&RegisterRequest { username })
            .send()
            .await
            .map_err(NetworkError::from)?;
        let body: RegisterResponse = decode(res).await?;
        match (body.user_id, body.error) {
            (Some(id), _) if !id.is_empty() => {
                debug!(user_id = %id, "registered");
                Ok(id)
            }
            (_, Some(reason)) => Err(RegisterError::Rejected(reason)),
            _ => Err(RegisterError::Network(NetworkError::Decode(
                "register response without user_id".into(),
            ))),
        }
    }

    async fn init_session(&self, sender_id: &str, receiver_id: &str) -> Result<(), SessionError> {
        let res = self
            .http
            .post(self.endpoint(&["session", "init"])?)
            .json(&SessionInitRequest {
                sender_id,
                receiver_id,
            })
            .send()
            .await
            .map_err(NetworkError::from)?;
        let body: StatusResponse = decode(res).await?;
        if let Some(reason) = body.error {
            warn!(sender_id, receiver_id, %reason, "session init refused");
            return Err(SessionError::Rejected(reason));
        }
        match body.status.as_deref() {
            Some(status) if is_established(status) => {
                debug!(
                    sender_id,
                    receiver_id,
                    used_one_time_prekey = body.used_one_time_prekey.unwrap_or(false),
                    "session established"
                );
                Ok(())
            }
            other => Err(SessionError::Rejected(format!(
                "unexpected session status {other:?}"
            ))),
        }
    }

    async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<(), SendError> {
        let res = self
            .http
            .post(self.endpoint(&["message", "send"])?)
            .json(&SendRequest {
                sender_id,
                receiver_id,
                text,
            })
            .send()
            .await
            .map_err(NetworkError::from)?;
        let body: StatusResponse = decode(res).await?;
        if let Some(reason) = body.error {
            return Err(SendError::Rejected(reason));
        }
        match body.status.as_deref() {
            Some("sent") => Ok(()),
            other => Err(SendError::Rejected(format!("unexpected send status {other:?}"))),
        }
    }

    async fn poll(&self, user_id: &str) -> Result<Vec<InboundMessage>, NetworkError> {
        let url = self.endpoint(&["message", "poll", user_id])?;
        let res = self.http.get(url).send().await?;
        let body: PollResponse = decode(res).await?;
        Ok(body.messages)
    }
}
