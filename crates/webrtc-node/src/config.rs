use std::env;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:8080/signaling";
pub const DEFAULT_CHANNEL_LABEL: &str = "villas";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const SERVER_ENV: &str = "WEBRTC_NODE_SERVER";

/// Relay or reflection server handed to the ICE agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Options applied when this endpoint opens the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub label: String,
    pub ordered: bool,
    /// `None` keeps the channel fully reliable.
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server: Url,
    pub session: String,
    /// Block `start()` until the data channel is open.
    pub wait: bool,
    pub channel: ChannelOptions,
    pub ice_servers: Vec<IceServer>,
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    session: Option<String>,
    server: Option<String>,
    wait: Option<bool>,
    ordered: Option<bool>,
    max_retransmits: Option<u16>,
    label: Option<String>,
    handshake_timeout: Option<f64>,
    backoff: Option<RawBackoff>,
    ice: Option<RawIce>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBackoff {
    initial: Option<f64>,
    factor: Option<f64>,
    maximum: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIce {
    #[serde(default)]
    servers: Vec<RawIceServer>,
}

#[derive(Debug, Deserialize)]
struct RawIceServer {
    urls: Urls,
    username: Option<String>,
    #[serde(alias = "credential")]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

impl NodeConfig {
    pub fn new(server: Url, session: impl Into<String>) -> Result<Self, ConfigError> {
        let config = Self {
            server,
            session: session.into(),
            wait: true,
            channel: ChannelOptions::default(),
            ice_servers: default_ice_servers(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            backoff: BackoffPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let raw = RawConfig::deserialize(value)?;

        let session = raw.session.unwrap_or_default();
        let server = match raw.server {
            Some(value) => parse_server(&value)?,
            None => parse_server(DEFAULT_SERVER)?,
        };
        let mut config = Self::new(server, session)?;

        if let Some(wait) = raw.wait {
            config.wait = wait;
        }
        if let Some(ordered) = raw.ordered {
            config.channel.ordered = ordered;
        }
        if raw.max_retransmits.is_some() {
            config.channel.max_retransmits = raw.max_retransmits;
        }
        if let Some(label) = raw.label {
            if label.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "label",
                    reason: "must not be empty".into(),
                });
            }
            config.channel.label = label;
        }
        if let Some(secs) = raw.handshake_timeout {
            config.handshake_timeout = seconds("handshake_timeout", secs)?;
        }
        if let Some(backoff) = raw.backoff {
            if let Some(secs) = backoff.initial {
                config.backoff.initial = seconds("backoff.initial", secs)?;
            }
            if let Some(factor) = backoff.factor {
                config.backoff.factor = factor;
            }
            if let Some(secs) = backoff.maximum {
                config.backoff.maximum = seconds("backoff.maximum", secs)?;
            }
        }
        if let Some(ice) = raw.ice {
            config.ice_servers = ice
                .servers
                .into_iter()
                .map(|server| {
                    let urls = match server.urls {
                        Urls::One(url) => vec![url],
                        Urls::Many(urls) => urls,
                    };
                    // Credentials only apply as a pair.
                    let (username, credential) = match (server.username, server.password) {
                        (Some(username), Some(password)) => (Some(username), Some(password)),
                        _ => (None, None),
                    };
                    IceServer {
                        urls,
                        username,
                        credential,
                    }
                })
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Replaces the server address with `WEBRTC_NODE_SERVER` when set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env::var(SERVER_ENV).ok().filter(|value| !value.trim().is_empty()) {
            let mut candidate = self.clone();
            candidate.server = parse_server(value.trim())?;
            candidate.validate()?;
            *self = candidate;
        }
        Ok(())
    }

    /// Signaling address of this session: the server URL with the session
    /// name appended as the final path segment.
    pub fn rendezvous_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::CannotBeBase(self.server.to_string()))?
            .pop_if_empty()
            .push(&self.session);
        Ok(url)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.trim().is_empty() {
            return Err(ConfigError::MissingSession);
        }
        if !matches!(self.server.scheme(), "ws" | "wss") {
            return Err(ConfigError::UnsupportedScheme(self.server.scheme().to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "handshake_timeout",
                reason: "must be positive".into(),
            });
        }
        if !(self.backoff.factor.is_finite() && self.backoff.factor >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "backoff.factor",
                reason: format!("{} is not a finite factor >= 1", self.backoff.factor),
            });
        }
        if self.backoff.maximum < self.backoff.initial {
            return Err(ConfigError::Invalid {
                field: "backoff.maximum",
                reason: "must not be smaller than backoff.initial".into(),
            });
        }
        self.rendezvous_url().map(|_| ())
    }
}

fn parse_server(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidServer {
        value: value.to_string(),
        source,
    })
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|err| ConfigError::Invalid {
        field,
        reason: err.to_string(),
    })
}

/// Serializes tests that read or write process environment variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
