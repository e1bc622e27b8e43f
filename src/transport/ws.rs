use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, trace, warn};
use url::Url;

use super::wire::SignalEnvelope;
use super::{SignalInbound, SignalingConnector, SignalingLink};
use crate::config::ClientConfig;
use crate::error::SignalingError;
use crate::types::Identity;

const KEEPALIVE: Duration = Duration::from_secs(30);

/// WebSocket connector for the signaling relay, one socket per identity at
/// `{base}/call/{user_id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(base: Url, connect_timeout: Duration) -> Self {
        Self {
            base,
            connect_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, SignalingError> {
        let base = config
            .signaling_base()
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        Ok(Self::new(base, config.connect_timeout()))
    }

    pub fn endpoint(&self, user_id: &str) -> Result<Url, SignalingError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SignalingError::Connect(format!("{} cannot be a base", self.base)))?
            .pop_if_empty()
            .push("call")
            .push(user_id);
        Ok(url)
    }
}

/// Decodes one text frame. Anything that is not a well-formed envelope is
/// reported as `Malformed`.
fn parse_frame(text: &str) -> SignalInbound {
    match serde_json::from_str::<SignalEnvelope>(text) {
        Ok(env) => SignalInbound::Envelope(env),
        Err(e) => SignalInbound::Malformed(format!("{e}: {}", truncate(text, 120))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, identity: &Identity) -> Result<SignalingLink, SignalingError> {
        let url = self.endpoint(&identity.id)?;
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|e| SignalingError::Connect(format!("websocket connect failed: {e}")))?;
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalInbound>();

        // Writer owns the sink: outbound envelopes plus keepalive pings.
        let writer = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    next = out_rx.recv() => {
                        let Some(env) = next else {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match serde_json::to_string(&env) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "dropping unserializable envelope");
                                continue;
                            }
                        };
                        trace!(kind = %env.kind, to = %env.to, "ws out");
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = keepalive.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let item = match msg {
                    Ok(Message::Text(text)) => parse_frame(&text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => parse_frame(&text),
                        Err(_) => SignalInbound::Malformed("binary frame is not utf-8".into()),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            tungstenite::Error::ConnectionClosed
                            | tungstenite::Error::AlreadyClosed => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                if in_tx.send(item).is_err() {
                    break;
                }
            }
            let _ = in_tx.send(SignalInbound::Closed);
            writer.abort();
        });

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
