use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use signaling_proto::{IceCandidate, SdpKind, SessionDescription};

use super::{
    ConnectionState, DataChannel, LinkError, PeerConnector, PeerEvent, PeerEventSink, PeerLink,
    SignalingState,
};
use crate::config::{ChannelOptions, IceServer};

/// Creates `webrtc-rs` peer connections sharing one API instance.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self, LinkError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        // Peers on one host must be able to pair over loopback alone.
        setting.set_include_loopback_candidate(true);
        Ok(Self {
            api: build_api(setting)?,
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, LinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| LinkError::new("register_default_codecs", err))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|err| LinkError::new("register_default_interceptors", err))?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|err| LinkError::new("new_peer_connection", err))?;
        let pc = Arc::new(pc);
        register_handlers(&pc, &sink);
        Ok(Arc::new(RtcLink { pc, sink }))
    }
}

fn register_handlers(pc: &RTCPeerConnection, sink: &PeerEventSink) {
    let events = sink.clone();
    pc.on_negotiation_needed(Box::new(move || {
        events.emit(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let events = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate = match candidate.map(|c| c.to_json()).transpose() {
            Ok(init) => Some(init.map(from_rtc_candidate)),
            Err(err) => {
                warn!(error = %err, "failed to serialize local candidate");
                None
            }
        };
        if let Some(candidate) = candidate {
            events.emit(PeerEvent::CandidateFound(candidate));
        }
        Box::pin(async {})
    }));

    let events = sink.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        events.emit(PeerEvent::SignalingStateChanged(from_rtc_signaling_state(state)));
        Box::pin(async {})
    }));

    let events = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        events.emit(PeerEvent::ConnectionStateChanged(from_rtc_connection_state(state)));
        Box::pin(async {})
    }));

    let events = sink.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        events.emit(PeerEvent::DataChannelOffered(dc.label().to_string()));
        attach_channel(&events, &dc);
        Box::pin(async {})
    }));
}

/// Routes the lifecycle and inbound messages of `dc` into `sink`.
fn attach_channel(sink: &PeerEventSink, dc: &Arc<RTCDataChannel>) {
    let id = sink.next_channel_id();
    trace!(generation = sink.generation(), id, label = %dc.label(), "registering data channel handlers");

    let events = sink.clone();
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    dc.on_open(Box::new(move || {
        if let Some(dc) = weak.upgrade() {
            events.emit(PeerEvent::ChannelOpened {
                id,
                channel: Arc::new(RtcChannel { dc }),
            });
        }
        Box::pin(async {})
    }));

    let events = sink.clone();
    dc.on_close(Box::new(move || {
        events.emit(PeerEvent::ChannelClosed { id });
        Box::pin(async {})
    }));

    let events = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if !events.deliver(msg.data).await {
                trace!(id, "session stopped; dropping inbound message");
            }
        })
    }));

    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            warn!(id, error = %err, "data channel error");
        })
    }));
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    sink: PeerEventSink,
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| LinkError::new("create_offer", err))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| LinkError::new("create_answer", err))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| LinkError::new("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| LinkError::new("set_remote_description", err))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        match from_rtc_description(&description) {
            Ok(description) => Some(description),
            Err(err) => {
                warn!(error = %err, "unusable local description");
                None
            }
        }
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| LinkError::new("add_ice_candidate", err))
    }

    fn signaling_state(&self) -> SignalingState {
        from_rtc_signaling_state(self.pc.signaling_state())
    }

    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), LinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await
            .map_err(|err| LinkError::new("create_data_channel", err))?;
        debug!(generation = self.sink.generation(), label = %options.label, "created data channel");
        attach_channel(&self.sink, &dc);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.pc
            .close()
            .await
            .map_err(|err| LinkError::new("close", err))
    }
}

struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        self.dc
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|err| LinkError::new("send", err))
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.dc
            .close()
            .await
            .map_err(|err| LinkError::new("close_data_channel", err))
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, LinkError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            return Ok(rollback);
        }
    };
    converted.map_err(|err| LinkError::new("parse_description", err))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, LinkError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(LinkError::new("description", "unspecified sdp type"));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn from_rtc_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}
