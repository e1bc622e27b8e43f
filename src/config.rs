// Client configuration.
// Logging defaults to on in debug builds and off in release builds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::peer::types::{IceServerKind, ServerConfig, DEFAULT_ICE_SERVERS};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url in {field}: {reason}")]
    Url { field: &'static str, reason: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive, e.g. `parley=debug,webrtc=warn`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: "parley=debug,webrtc=warn".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the registration / session / message backend.
    pub api_url: Url,
    /// Base URL of the signaling relay. Derived from `api_url` when absent.
    pub signaling_url: Option<Url>,
    pub poll_interval_ms: u64,
    pub dedup_bucket_ms: u64,
    pub suppress_duplicates: bool,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ice_servers: Vec<ServerConfig>,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: Url::parse("http://127.0.0.1:8000").expect("static url"),
            signaling_url: None,
            poll_interval_ms: 1_500,
            dedup_bucket_ms: 2_000,
            suppress_duplicates: false,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: ClientConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `PARLEY_API_URL`, `PARLEY_SIGNALING_URL`,
    /// `PARLEY_POLL_INTERVAL_MS` and `PARLEY_LOG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = ClientConfig::default();
        if let Some(raw) = lookup("PARLEY_API_URL") {
            cfg.api_url = parse_url("PARLEY_API_URL", &raw)?;
        }
        if let Some(raw) = lookup("PARLEY_SIGNALING_URL") {
            cfg.signaling_url = Some(parse_url("PARLEY_SIGNALING_URL", &raw)?);
        }
        if let Some(raw) = lookup("PARLEY_POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "PARLEY_POLL_INTERVAL_MS",
                reason: format!("not a number: {raw}"),
            })?;
        }
        if let Some(filter) = lookup("PARLEY_LOG") {
            cfg.log.enabled = true;
            cfg.log.filter = filter;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.dedup_bucket_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "dedup_bucket_ms",
                reason: "must be greater than zero".into(),
            });
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "ice_servers",
                    reason: format!("server {} has an empty url", server.id),
                });
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid {
                    field: "ice_servers",
                    reason: format!("TURN server {} requires username and credential", server.id),
                });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// WebSocket base of the signaling relay: the explicit value, or the
    /// API url with `http`/`https` swapped for `ws`/`wss`.
    pub fn signaling_base(&self) -> Result<Url, ConfigError> {
        if let Some(url) = &self.signaling_url {
            return Ok(url.clone());
        }
        let mut url = self.api_url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| ConfigError::Url {
            field: "api_url",
            reason: format!("cannot derive websocket url from {}", self.api_url),
        })?;
        Ok(url)
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| ConfigError::Url {
        field,
        reason: e.to_string(),
    })
}
