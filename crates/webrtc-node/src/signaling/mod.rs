//! Control channel to the rendezvous server.

mod client;

use async_trait::async_trait;

pub use client::SignalingClient;
pub use signaling_proto::{
    Connection, ConnectionId, Control, IceCandidate, Role, SdpKind, SessionDescription,
    SignalingMessage,
};

use crate::error::SendError;

/// Outbound half of the signaling channel as seen by the negotiation engine.
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SendError>;
}

#[async_trait]
impl SignalingSender for SignalingClient {
    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SendError> {
        SignalingClient::send_message(self, message).await
    }
}
