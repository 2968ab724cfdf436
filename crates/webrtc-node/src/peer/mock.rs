//! In-memory stand-ins for the connection capability and signaling channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use signaling_proto::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};

use super::{
    ConnectionState, DataChannel, LinkError, PeerConnector, PeerEvent, PeerEventSink, PeerLink,
    SignalingState,
};
use crate::config::ChannelOptions;
use crate::error::SendError;
use crate::signaling::SignalingSender;

pub(crate) struct MockChannel {
    label: String,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub(crate) fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::new("send", "channel closed"));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Follows the offer/answer state transitions of a real peer connection
/// without any media or network underneath.
pub(crate) struct MockLink {
    name: String,
    sink: PeerEventSink,
    state: Mutex<SignalingState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    channels: Mutex<Vec<ChannelOptions>>,
    closed: AtomicBool,
}

impl MockLink {
    pub(crate) fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub(crate) fn sink(&self) -> &PeerEventSink {
        &self.sink
    }

    pub(crate) fn state(&self) -> SignalingState {
        *self.state.lock()
    }

    pub(crate) fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub(crate) fn channels_created(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), LinkError> {
        if self.is_closed() {
            Err(LinkError::new(operation, "connection closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.ensure_open("create_offer")?;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}",
            self.name,
            self.generation()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.ensure_open("create_answer")?;
        if self.state() != SignalingState::HaveRemoteOffer {
            return Err(LinkError::new("create_answer", "no remote offer"));
        }
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.name,
            self.generation()
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.ensure_open("set_local_description")?;
        let mut state = self.state.lock();
        *state = match (description.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(LinkError::new(
                    "set_local_description",
                    format!("{kind:?} invalid in {current:?}"),
                ))
            }
        };
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.ensure_open("set_remote_description")?;
        let mut state = self.state.lock();
        *state = match (description.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(LinkError::new(
                    "set_remote_description",
                    format!("{kind:?} invalid in {current:?}"),
                ))
            }
        };
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.ensure_open("add_candidate")?;
        if self.remote.lock().is_none() {
            return Err(LinkError::new("add_candidate", "no remote description"));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state()
    }

    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), LinkError> {
        self.ensure_open("create_data_channel")?;
        let first = {
            let mut channels = self.channels.lock();
            channels.push(options.clone());
            channels.len() == 1
        };
        if first {
            self.sink.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.state.lock() = SignalingState::Closed;
            self.sink
                .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

pub(crate) struct MockConnector {
    name: String,
    links: Mutex<Vec<Arc<MockLink>>>,
    fail: AtomicBool,
}

impl MockConnector {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            links: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub(crate) fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    pub(crate) fn current(&self) -> Arc<MockLink> {
        self.links
            .lock()
            .last()
            .cloned()
            .expect("no link created yet")
    }

    pub(crate) fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(LinkError::new("new_peer_connection", "refused"));
        }
        let link = Arc::new(MockLink {
            name: self.name.clone(),
            sink,
            state: Mutex::new(SignalingState::Stable),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Default)]
pub(crate) struct MockSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
    fail: AtomicBool,
}

impl MockSignaling {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn take(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingSender for MockSignaling {
    async fn send_message(&self, message: &SignalingMessage) -> Result<(), SendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
