//! Peer connection capabilities and the negotiation engine driving them.
//!
//! The engine never touches the WebRTC stack directly; it talks to a
//! [`PeerLink`] produced by a [`PeerConnector`]. [`RtcConnector`] backs these
//! traits with `webrtc-rs`.

mod negotiation;
mod rtc;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use signaling_proto::{IceCandidate, SessionDescription};

use crate::config::ChannelOptions;

pub use negotiation::PeerConnection;
pub(crate) use negotiation::EngineInput;
pub use rtc::RtcConnector;

/// Failure reported by the underlying connection capability.
#[derive(Debug, Error)]
#[error("{operation}: {message}")]
pub struct LinkError {
    pub operation: &'static str,
    pub message: String,
}

impl LinkError {
    pub fn new(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            operation,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One underlying peer connection. Replaced wholesale on rollback and after
/// every close.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;
    fn signaling_state(&self) -> SignalingState;
    /// Opens a data channel. Its lifecycle is reported through the sink the
    /// link was created with.
    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), LinkError>;
    async fn close(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, LinkError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send(&self, payload: Bytes) -> Result<(), LinkError>;
    async fn close(&self) -> Result<(), LinkError>;
}

pub enum PeerEvent {
    NegotiationNeeded,
    /// `None` marks the end of candidate gathering.
    CandidateFound(Option<IceCandidate>),
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(ConnectionState),
    DataChannelOffered(String),
    ChannelOpened { id: u64, channel: Arc<dyn DataChannel> },
    ChannelClosed { id: u64 },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::CandidateFound(candidate) => {
                f.debug_tuple("CandidateFound").field(candidate).finish()
            }
            PeerEvent::SignalingStateChanged(state) => {
                f.debug_tuple("SignalingStateChanged").field(state).finish()
            }
            PeerEvent::ConnectionStateChanged(state) => {
                f.debug_tuple("ConnectionStateChanged").field(state).finish()
            }
            PeerEvent::DataChannelOffered(label) => {
                f.debug_tuple("DataChannelOffered").field(label).finish()
            }
            PeerEvent::ChannelOpened { id, channel } => f
                .debug_struct("ChannelOpened")
                .field("id", id)
                .field("label", &channel.label())
                .finish(),
            PeerEvent::ChannelClosed { id } => {
                f.debug_struct("ChannelClosed").field("id", id).finish()
            }
        }
    }
}

/// Where a link reports its callbacks. Every event is stamped with the
/// generation of the link that produced it, so events of a replaced link can
/// be told apart from current ones.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    events: mpsc::UnboundedSender<EngineInput>,
    inbound: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    channel_ids: Arc<AtomicU64>,
}

impl PeerEventSink {
    pub(crate) fn new(
        generation: u64,
        events: mpsc::UnboundedSender<EngineInput>,
        inbound: mpsc::Sender<Bytes>,
        stop: CancellationToken,
        channel_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            generation,
            events,
            inbound,
            stop,
            channel_ids,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(EngineInput::Peer {
            generation: self.generation,
            event,
        });
    }

    pub fn next_channel_id(&self) -> u64 {
        self.channel_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queues an inbound payload, waiting while the queue is full. Returns
    /// `false` once the session is stopped.
    pub async fn deliver(&self, payload: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.inbound.send(payload) => sent.is_ok(),
        }
    }
}
