use thiserror::Error;

use crate::peer::LinkError;

/// Failure to establish the signaling transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("handshake with {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u128 },
    #[error("failed to dial {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("signaling client is closing")]
    Closing,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("signaling transport not connected")]
    NotConnected,
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write signaling message: {0}")]
    Write(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid node configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing or empty session name")]
    MissingSession,
    #[error("failed to parse server address {value:?}: {source}")]
    InvalidServer {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported signaling scheme {0:?}; expected ws or wss")]
    UnsupportedScheme(String),
    #[error("server address {0} cannot carry a session path")]
    CannotBeBase(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Conditions that end a negotiation session. None of them are recoverable
/// within the session; the owning supervisor tears it down.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("session already has {0} participants")]
    TooManyConnections(usize),
    #[error("failed to create peer connection: {0}")]
    Create(#[source] LinkError),
    #[error("failed to create data channel: {0}")]
    Channel(#[source] LinkError),
    #[error("failed to make offer: {0}")]
    Offer(#[source] LinkError),
    #[error("failed to send offer: {0}")]
    SendOffer(#[source] SendError),
    #[error("failed to answer offer: {0}")]
    Answer(#[source] LinkError),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(#[source] LinkError),
    #[error("failed to add ice candidate: {0}")]
    Candidate(#[source] LinkError),
    #[error("failed to roll back peer connection: {0}")]
    Rollback(#[source] LinkError),
    #[error("failed to close peer connection: {0}")]
    Close(#[source] LinkError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up peer connections: {0}")]
    Setup(#[source] LinkError),
    #[error("peer session failed: {0}")]
    SessionFailed(String),
    #[error("node is {0}")]
    InvalidState(&'static str),
    #[error("data channel send failed: {0}")]
    Channel(#[from] LinkError),
}
