//! Wire types exchanged over the signaling channel.
//! Shared by the node library and the relay so both sides agree on the
//! JSON shape without pulling in the WebRTC stack.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub type ConnectionId = u64;

/// Largest roster a session may carry.
pub const MAX_PARTICIPANTS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("signaling message carries none of description, candidate or control")]
    Empty,
    #[error("signaling message carries more than one of description, candidate or control")]
    Ambiguous,
    #[error("session already has {0} participants")]
    TooManyConnections(usize),
}

/// One signaling payload. Exactly one variant travels per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum SignalingMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Control(Control),
}

impl SignalingMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Description(_) => "description",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Control(_) => "control",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    control: Option<Control>,
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match (wire.description, wire.candidate, wire.control) {
            (Some(description), None, None) => Ok(SignalingMessage::Description(description)),
            (None, Some(candidate), None) => Ok(SignalingMessage::Candidate(candidate)),
            (None, None, Some(control)) => Ok(SignalingMessage::Control(control)),
            (None, None, None) => Err(ProtocolError::Empty),
            _ => Err(ProtocolError::Ambiguous),
        }
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(message: SignalingMessage) -> Self {
        let mut wire = WireMessage::default();
        match message {
            SignalingMessage::Description(description) => wire.description = Some(description),
            SignalingMessage::Candidate(candidate) => wire.candidate = Some(candidate),
            SignalingMessage::Control(control) => wire.control = Some(control),
        }
        wire
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Session roster pushed by the relay whenever membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// Negotiation role of one endpoint within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Role {
    pub polite: bool,
    pub first: bool,
}

impl Control {
    pub fn participants(&self) -> usize {
        self.connections.len()
    }

    /// The endpoint with the smallest connection id joined first and
    /// plays the polite side.
    pub fn role(&self) -> Result<Role, ProtocolError> {
        if self.connections.len() > MAX_PARTICIPANTS {
            return Err(ProtocolError::TooManyConnections(self.connections.len()));
        }
        let first = !self
            .connections
            .iter()
            .any(|connection| connection.id < self.connection_id);
        Ok(Role {
            polite: first,
            first,
        })
    }
}
