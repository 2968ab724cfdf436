use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use signaling_proto::{Control, IceCandidate, ProtocolError, Role, SessionDescription, SignalingMessage};

use super::{ConnectionState, PeerConnector, PeerEvent, PeerEventSink, PeerLink, SignalingState};
use crate::channel::ChannelState;
use crate::config::{ChannelOptions, NodeConfig};
use crate::error::{ConfigError, ConnectError, NegotiationError};
use crate::signaling::{SignalingClient, SignalingSender};

/// Everything the engine reacts to, funnelled through one queue so that
/// handlers for a session never run concurrently.
pub(crate) enum EngineInput {
    SignalingConnected,
    SignalingDisconnected,
    Signaling(SignalingMessage),
    Peer { generation: u64, event: PeerEvent },
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NegotiationState {
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub rolling_back: bool,
}

/// Perfect-negotiation state machine for one session.
pub(crate) struct Negotiator {
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingSender>,
    channel: Arc<ChannelState>,
    options: ChannelOptions,
    events: mpsc::UnboundedSender<EngineInput>,
    inbound: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    channel_ids: Arc<AtomicU64>,
    link: Option<Arc<dyn PeerLink>>,
    generation: u64,
    role: Option<Role>,
    state: NegotiationState,
}

impl Negotiator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingSender>,
        channel: Arc<ChannelState>,
        inbound: mpsc::Sender<Bytes>,
        options: ChannelOptions,
        events: mpsc::UnboundedSender<EngineInput>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            connector,
            signaling,
            channel,
            options,
            events,
            inbound,
            stop,
            channel_ids: Arc::new(AtomicU64::new(0)),
            link: None,
            generation: 0,
            role: None,
            state: NegotiationState::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn role(&self) -> Option<Role> {
        self.role
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    fn polite(&self) -> bool {
        self.role.is_some_and(|role| role.polite)
    }

    fn first(&self) -> bool {
        self.role.is_some_and(|role| role.first)
    }

    /// Processes inputs until shutdown is requested or a handler fails.
    pub(crate) async fn run(
        &mut self,
        inputs: &mut mpsc::UnboundedReceiver<EngineInput>,
    ) -> Result<(), NegotiationError> {
        while let Some(input) = inputs.recv().await {
            if matches!(input, EngineInput::Shutdown) {
                break;
            }
            self.handle(input).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle(&mut self, input: EngineInput) -> Result<(), NegotiationError> {
        match input {
            EngineInput::SignalingConnected => self.on_signaling_connected().await,
            EngineInput::SignalingDisconnected => {
                debug!("signaling disconnected");
                Ok(())
            }
            EngineInput::Signaling(SignalingMessage::Control(control)) => self.on_control(&control),
            EngineInput::Signaling(SignalingMessage::Description(description)) => {
                self.on_description(description).await
            }
            EngineInput::Signaling(SignalingMessage::Candidate(candidate)) => {
                self.on_remote_candidate(candidate).await
            }
            EngineInput::Peer { generation, event } => self.on_peer_event(generation, event).await,
            EngineInput::Shutdown => Ok(()),
        }
    }

    /// Closes the active channel and the current connection.
    pub(crate) async fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "closing data channel");
            }
        }
        if let Some(link) = self.link.take() {
            if let Err(err) = link.close().await {
                warn!(error = %err, "failed to close peer connection");
            }
        }
    }

    async fn on_signaling_connected(&mut self) -> Result<(), NegotiationError> {
        info!("signaling connected");
        if self.link.is_none() {
            self.open_link().await?;
            self.connection_created().await?;
        }
        Ok(())
    }

    fn on_control(&mut self, control: &Control) -> Result<(), NegotiationError> {
        let role = match control.role() {
            Ok(role) => role,
            Err(ProtocolError::TooManyConnections(count)) => {
                return Err(NegotiationError::TooManyConnections(count))
            }
            Err(err) => {
                warn!(error = %err, "ignoring unusable control message");
                return Ok(());
            }
        };
        if self.role != Some(role) {
            info!(
                connection_id = control.connection_id,
                participants = control.participants(),
                polite = role.polite,
                first = role.first,
                "negotiation role assigned"
            );
        }
        self.role = Some(role);
        Ok(())
    }

    async fn on_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(mut link) = self.link.clone() else {
            warn!(kind = ?description.kind, "description received without a peer connection");
            return Ok(());
        };

        let is_offer = description.is_offer();
        let ready_for_offer =
            !self.state.making_offer && link.signaling_state() == SignalingState::Stable;
        let offer_collision = is_offer && !ready_for_offer;

        self.state.ignore_offer = !self.polite() && offer_collision;
        if self.state.ignore_offer {
            info!(generation = self.generation, "ignoring colliding offer");
            return Ok(());
        }

        if is_offer && link.signaling_state() != SignalingState::Stable {
            link = self.rollback().await?;
        }

        link.set_remote_description(description)
            .await
            .map_err(NegotiationError::RemoteDescription)?;

        if is_offer {
            let answer = link.create_answer().await.map_err(NegotiationError::Answer)?;
            link.set_local_description(answer)
                .await
                .map_err(NegotiationError::Answer)?;
            let Some(local) = link.local_description().await else {
                warn!("no local description after answering");
                return Ok(());
            };
            if let Err(err) = self
                .signaling
                .send_message(&SignalingMessage::Description(local))
                .await
            {
                warn!(error = %err, "failed to send answer");
            }
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let Some(link) = self.link.clone() else {
            debug!("candidate received without a peer connection");
            return Ok(());
        };
        match link.add_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) if self.state.ignore_offer => {
                debug!(error = %err, "dropping candidate of ignored offer");
                Ok(())
            }
            Err(err) => Err(NegotiationError::Candidate(err)),
        }
    }

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) -> Result<(), NegotiationError> {
        // Channel closures are tracked by channel id, whatever link produced them.
        if let PeerEvent::ChannelClosed { id } = event {
            return self.on_channel_closed(generation, id).await;
        }
        if generation != self.generation {
            trace!(generation, current = self.generation, event = ?event, "ignoring event of replaced connection");
            return Ok(());
        }

        match event {
            PeerEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            PeerEvent::CandidateFound(None) => {
                info!(generation, "candidate gathering concluded");
                Ok(())
            }
            PeerEvent::CandidateFound(Some(candidate)) => {
                debug!(generation, candidate = %candidate.candidate, "found local candidate");
                if let Err(err) = self
                    .signaling
                    .send_message(&SignalingMessage::Candidate(candidate))
                    .await
                {
                    warn!(error = %err, "failed to send candidate");
                }
                Ok(())
            }
            PeerEvent::SignalingStateChanged(state) => {
                info!(generation, state = ?state, "signaling state changed");
                Ok(())
            }
            PeerEvent::ConnectionStateChanged(state) => {
                info!(generation, state = ?state, "connection state changed");
                self.on_connection_state(state).await
            }
            PeerEvent::DataChannelOffered(label) => {
                info!(generation, label = %label, "remote data channel offered");
                Ok(())
            }
            PeerEvent::ChannelOpened { id, channel } => {
                self.channel.attach(generation, id, channel);
                Ok(())
            }
            PeerEvent::ChannelClosed { .. } => Ok(()),
        }
    }

    async fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        let Some(link) = self.link.clone() else {
            return Ok(());
        };
        if link.signaling_state() != SignalingState::Stable {
            debug!(state = ?link.signaling_state(), "negotiation deferred until stable");
            return Ok(());
        }

        info!(generation = self.generation, "negotiation needed");
        self.state.making_offer = true;
        let result = self.make_offer(link.as_ref()).await;
        self.state.making_offer = false;
        result
    }

    async fn make_offer(&self, link: &dyn PeerLink) -> Result<(), NegotiationError> {
        let offer = link.create_offer().await.map_err(NegotiationError::Offer)?;
        link.set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::Offer)?;
        self.signaling
            .send_message(&SignalingMessage::Description(offer))
            .await
            .map_err(NegotiationError::SendOffer)
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> Result<(), NegotiationError> {
        match state {
            ConnectionState::Failed | ConnectionState::Disconnected => {
                if let Some(link) = self.link.clone() {
                    info!(generation = self.generation, "closing peer connection");
                    link.close().await.map_err(NegotiationError::Close)?;
                }
                Ok(())
            }
            ConnectionState::Closed => {
                info!(generation = self.generation, "peer connection closed");
                self.channel.detach_generation(self.generation);
                self.open_link().await?;
                self.connection_created().await
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
        }
    }

    async fn on_channel_closed(&mut self, generation: u64, id: u64) -> Result<(), NegotiationError> {
        info!(generation, id, "data channel closed");
        let Some(owner) = self.channel.detach(id) else {
            return Ok(());
        };
        // Skip waiting for the disconnect event of the owning connection.
        if owner == self.generation {
            if let Some(link) = self.link.clone() {
                if let Err(err) = link.close().await {
                    error!(error = %err, "failed to close peer connection");
                }
            }
        }
        Ok(())
    }

    /// Replaces the current connection, since the underlying stack cannot
    /// roll back a local offer in place.
    async fn rollback(&mut self) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        info!(generation = self.generation, "rolling back peer connection");
        self.state.rolling_back = true;
        let result = self.replace_link().await;
        self.state.rolling_back = false;
        result
    }

    async fn replace_link(&mut self) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        if let Some(previous) = self.link.take() {
            previous.close().await.map_err(NegotiationError::Rollback)?;
            self.channel.detach_generation(self.generation);
        }
        let link = self.open_link().await?;
        self.connection_created().await?;
        Ok(link)
    }

    async fn open_link(&mut self) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.generation += 1;
        let sink = PeerEventSink::new(
            self.generation,
            self.events.clone(),
            self.inbound.clone(),
            self.stop.clone(),
            Arc::clone(&self.channel_ids),
        );
        let link = self
            .connector
            .connect(sink)
            .await
            .map_err(NegotiationError::Create)?;
        info!(generation = self.generation, "created new peer connection");
        self.link = Some(Arc::clone(&link));
        Ok(link)
    }

    /// The endpoint that joined later opens the data channel.
    async fn connection_created(&mut self) -> Result<(), NegotiationError> {
        if self.first() {
            return Ok(());
        }
        if let Some(link) = self.link.clone() {
            link.create_data_channel(&self.options)
                .await
                .map_err(NegotiationError::Channel)?;
        }
        Ok(())
    }
}

/// Owns the signaling client and the negotiation engine of one session and
/// tears both down when the engine reports a fatal error.
pub struct PeerConnection {
    signaling: SignalingClient,
    channel: Arc<ChannelState>,
    stop: CancellationToken,
    events: mpsc::UnboundedSender<EngineInput>,
    failure: Arc<Mutex<Option<String>>>,
    engine: AsyncMutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Wires the signaling client to a fresh engine. Must be called from
    /// within a Tokio runtime; nothing is dialed until [`connect`](Self::connect).
    pub fn new(
        config: &NodeConfig,
        connector: Arc<dyn PeerConnector>,
        stop: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let url = config.rendezvous_url()?;
        let signaling = SignalingClient::new(url, config.handshake_timeout, config.backoff);
        let (events, mut inputs) = mpsc::unbounded_channel();
        let (channel, inbound) = ChannelState::new();

        {
            let events = events.clone();
            signaling.on_connect(move || {
                let _ = events.send(EngineInput::SignalingConnected);
            });
        }
        {
            let events = events.clone();
            signaling.on_disconnect(move || {
                let _ = events.send(EngineInput::SignalingDisconnected);
            });
        }
        {
            let events = events.clone();
            signaling.on_message(move |message| {
                let _ = events.send(EngineInput::Signaling(message.clone()));
            });
        }

        let mut negotiator = Negotiator::new(
            connector,
            Arc::new(signaling.clone()),
            Arc::clone(&channel),
            inbound,
            config.channel.clone(),
            events.clone(),
            stop.clone(),
        );
        let failure = Arc::new(Mutex::new(None));

        let engine = {
            let signaling = signaling.clone();
            let stop = stop.clone();
            let failure = Arc::clone(&failure);
            tokio::spawn(async move {
                match negotiator.run(&mut inputs).await {
                    Ok(()) => debug!("negotiation engine stopped"),
                    Err(err) => {
                        error!(error = %err, "peer session failed");
                        *failure.lock() = Some(err.to_string());
                        stop.cancel();
                        signaling.close().await;
                    }
                }
                negotiator.shutdown().await;
            })
        };

        Ok(Self {
            signaling,
            channel,
            stop,
            events,
            failure,
            engine: AsyncMutex::new(Some(engine)),
        })
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.signaling.connect_with_backoff().await
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn channel(&self) -> &ChannelState {
        &self.channel
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Reason the session was torn down by the engine, if it was.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Stops the session: stop signal, then signaling, then the connection.
    pub async fn close(&self) {
        self.stop.cancel();
        self.signaling.close().await;
        let _ = self.events.send(EngineInput::Shutdown);
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            if let Err(err) = engine.await {
                warn!(error = %err, "negotiation engine task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockChannel, MockConnector, MockSignaling};
    use signaling_proto::{Connection, SdpKind};
    use time::OffsetDateTime;

    struct Harness {
        engine: Negotiator,
        inputs: mpsc::UnboundedReceiver<EngineInput>,
        connector: Arc<MockConnector>,
        signaling: Arc<MockSignaling>,
        channel: Arc<ChannelState>,
        _inbound: mpsc::Sender<Bytes>,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let connector = MockConnector::new(name);
            let signaling = MockSignaling::new();
            let (channel, inbound) = ChannelState::new();
            let (events, inputs) = mpsc::unbounded_channel();
            let engine = Negotiator::new(
                connector.clone(),
                signaling.clone(),
                Arc::clone(&channel),
                inbound.clone(),
                ChannelOptions::default(),
                events,
                CancellationToken::new(),
            );
            Self {
                engine,
                inputs,
                connector,
                signaling,
                channel,
                _inbound: inbound,
            }
        }

        /// Handles `input`, then everything it caused.
        async fn feed(&mut self, input: EngineInput) -> Result<(), NegotiationError> {
            self.engine.handle(input).await?;
            self.pump().await
        }

        async fn pump(&mut self) -> Result<(), NegotiationError> {
            while let Ok(input) = self.inputs.try_recv() {
                self.engine.handle(input).await?;
            }
            Ok(())
        }

        async fn join(&mut self, own: u64, ids: &[u64]) -> Result<(), NegotiationError> {
            self.feed(EngineInput::Signaling(control(own, ids))).await?;
            self.feed(EngineInput::SignalingConnected).await
        }

        async fn negotiate(&mut self) -> Result<(), NegotiationError> {
            self.connector
                .current()
                .sink()
                .emit(PeerEvent::NegotiationNeeded);
            self.pump().await
        }

        fn sent_descriptions(&self) -> Vec<SessionDescription> {
            self.signaling
                .take()
                .into_iter()
                .filter_map(|message| match message {
                    SignalingMessage::Description(description) => Some(description),
                    _ => None,
                })
                .collect()
        }
    }

    fn control(own: u64, ids: &[u64]) -> SignalingMessage {
        SignalingMessage::Control(Control {
            connection_id: own,
            connections: ids
                .iter()
                .map(|id| Connection {
                    id: *id,
                    remote: "127.0.0.1".into(),
                    user_agent: "test".into(),
                    created: OffsetDateTime::UNIX_EPOCH,
                })
                .collect(),
        })
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn later_joiner_opens_channel_and_offers() {
        let mut late = Harness::new("b");
        late.join(2, &[1, 2]).await.expect("join");

        assert_eq!(
            late.engine.role(),
            Some(Role {
                polite: false,
                first: false
            })
        );
        let link = late.connector.current();
        assert_eq!(link.channels_created(), 1);
        let sent = late.sent_descriptions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SdpKind::Offer);
        assert_eq!(link.state(), SignalingState::HaveLocalOffer);
        assert!(!late.engine.state().making_offer);
    }

    #[tokio::test]
    async fn first_joiner_waits_for_remote_channel() {
        let mut early = Harness::new("a");
        early.join(1, &[1]).await.expect("join");
        assert_eq!(early.connector.current().channels_created(), 0);
        assert!(early.sent_descriptions().is_empty());

        early
            .feed(EngineInput::Signaling(SignalingMessage::Description(
                SessionDescription::offer("offer:b:1"),
            )))
            .await
            .expect("answer");
        let sent = early.sent_descriptions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SdpKind::Answer);
        assert_eq!(early.connector.current().state(), SignalingState::Stable);
        assert_eq!(early.engine.generation(), 1);
    }

    #[tokio::test]
    async fn second_signaling_connect_keeps_connection() {
        let mut early = Harness::new("a");
        early.join(1, &[1]).await.expect("join");
        early
            .feed(EngineInput::SignalingConnected)
            .await
            .expect("reconnect");
        assert_eq!(early.connector.links().len(), 1);
    }

    #[tokio::test]
    async fn signaling_drop_keeps_session_and_rederives_role() {
        let mut late = Harness::new("b");
        late.join(2, &[1, 2]).await.expect("join");
        let link = late.connector.current();
        assert_eq!(late.sent_descriptions().len(), 1);
        late.feed(EngineInput::Signaling(SignalingMessage::Description(
            SessionDescription::answer("answer:a:1"),
        )))
        .await
        .expect("answer");
        let channel = MockChannel::new("villas");
        let id = link.sink().next_channel_id();
        link.sink().emit(PeerEvent::ChannelOpened {
            id,
            channel: channel.clone(),
        });
        late.pump().await.expect("open");

        // The remote rejoined under a larger id, so this side is now first.
        late.feed(EngineInput::SignalingDisconnected)
            .await
            .expect("drop");
        late.feed(EngineInput::Signaling(control(2, &[2, 3])))
            .await
            .expect("roster");
        late.feed(EngineInput::SignalingConnected)
            .await
            .expect("reconnect");

        assert_eq!(
            late.engine.role(),
            Some(Role {
                polite: true,
                first: true
            })
        );
        assert_eq!(late.connector.links().len(), 1);
        assert_eq!(late.engine.generation(), 1);
        assert!(late.channel.is_open());
        assert!(late
            .channel
            .write(Bytes::from_static(b"after reconnect"))
            .await
            .expect("write"));
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"after reconnect")]);

        late.feed(EngineInput::Signaling(SignalingMessage::Description(
            SessionDescription::offer("offer:a:2"),
        )))
        .await
        .expect("renegotiate");
        let sent = late.sent_descriptions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SdpKind::Answer);
        assert_eq!(link.state(), SignalingState::Stable);
        assert!(late.channel.is_open());
    }

    #[tokio::test]
    async fn impolite_peer_ignores_colliding_offer() {
        let mut late = Harness::new("b");
        late.join(2, &[1, 2]).await.expect("join");
        late.sent_descriptions();

        late.feed(EngineInput::Signaling(SignalingMessage::Description(
            SessionDescription::offer("offer:a:1"),
        )))
        .await
        .expect("ignored");

        assert!(late.engine.state().ignore_offer);
        assert!(late.sent_descriptions().is_empty());
        assert_eq!(late.engine.generation(), 1);
        let link = late.connector.current();
        assert_eq!(link.state(), SignalingState::HaveLocalOffer);
        assert!(link.remote().is_none());
    }

    #[tokio::test]
    async fn polite_peer_rolls_back_and_answers() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        early.negotiate().await.expect("offer");
        assert_eq!(early.sent_descriptions().len(), 1);

        early
            .feed(EngineInput::Signaling(SignalingMessage::Description(
                SessionDescription::offer("offer:b:1"),
            )))
            .await
            .expect("rollback");

        assert_eq!(early.engine.generation(), 2);
        let links = early.connector.links();
        assert_eq!(links.len(), 2);
        assert!(links[0].is_closed());
        assert_eq!(links[1].state(), SignalingState::Stable);
        assert_eq!(links[1].remote().map(|d| d.sdp), Some("offer:b:1".to_string()));
        assert!(!early.engine.state().rolling_back);

        let sent = early.sent_descriptions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], SessionDescription::answer("answer:a:2"));
        assert_eq!(links[1].channels_created(), 0);
    }

    #[tokio::test]
    async fn simultaneous_offers_resolve_to_impolite_offer() {
        let mut polite = Harness::new("a");
        let mut impolite = Harness::new("b");
        polite.join(1, &[1, 2]).await.expect("join a");
        impolite.join(2, &[1, 2]).await.expect("join b");
        // The channel creator's initial offer takes part in the first round.
        for round in 0..3 {
            polite.negotiate().await.expect("polite offer");
            if impolite.connector.current().state() == SignalingState::Stable {
                impolite.negotiate().await.expect("impolite offer");
            }
            let from_polite = polite.sent_descriptions();
            let from_impolite = impolite.sent_descriptions();
            assert_eq!(from_polite.len(), 1, "round {round}");
            assert_eq!(from_impolite.len(), 1, "round {round}");

            impolite
                .feed(EngineInput::Signaling(SignalingMessage::Description(
                    from_polite[0].clone(),
                )))
                .await
                .expect("impolite handles offer");
            polite
                .feed(EngineInput::Signaling(SignalingMessage::Description(
                    from_impolite[0].clone(),
                )))
                .await
                .expect("polite handles offer");

            assert!(impolite.sent_descriptions().is_empty(), "round {round}");
            let answers = polite.sent_descriptions();
            assert_eq!(answers.len(), 1, "round {round}");
            assert_eq!(answers[0].kind, SdpKind::Answer);

            impolite
                .feed(EngineInput::Signaling(SignalingMessage::Description(
                    answers[0].clone(),
                )))
                .await
                .expect("impolite applies answer");

            let survivor = impolite.connector.current();
            assert_eq!(survivor.state(), SignalingState::Stable, "round {round}");
            assert_eq!(
                polite.connector.current().remote(),
                Some(from_impolite[0].clone()),
                "round {round}"
            );
        }

        let impolite_channels: usize = impolite
            .connector
            .links()
            .iter()
            .map(|link| link.channels_created())
            .sum();
        let polite_channels: usize = polite
            .connector
            .links()
            .iter()
            .map(|link| link.channels_created())
            .sum();
        assert_eq!(polite_channels, 0);
        assert_eq!(impolite_channels, 1);
        assert_eq!(impolite.connector.links().len(), 1);
        assert_eq!(polite.connector.links().len(), 4);
    }

    #[tokio::test]
    async fn candidates_of_ignored_offer_are_dropped() {
        let mut late = Harness::new("b");
        late.join(2, &[1, 2]).await.expect("join");
        late.feed(EngineInput::Signaling(SignalingMessage::Description(
            SessionDescription::offer("offer:a:1"),
        )))
        .await
        .expect("ignored");

        late.feed(EngineInput::Signaling(SignalingMessage::Candidate(candidate())))
            .await
            .expect("suppressed");
        assert!(late.connector.current().candidates().is_empty());
    }

    #[tokio::test]
    async fn failing_candidate_outside_ignored_offer_is_fatal() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");

        let err = early
            .feed(EngineInput::Signaling(SignalingMessage::Candidate(candidate())))
            .await
            .expect_err("no remote description yet");
        assert!(matches!(err, NegotiationError::Candidate(_)), "{err}");
    }

    #[tokio::test]
    async fn candidates_apply_after_remote_description() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        early
            .feed(EngineInput::Signaling(SignalingMessage::Description(
                SessionDescription::offer("offer:b:1"),
            )))
            .await
            .expect("answer");
        early
            .feed(EngineInput::Signaling(SignalingMessage::Candidate(candidate())))
            .await
            .expect("candidate");
        assert_eq!(early.connector.current().candidates(), vec![candidate()]);
    }

    #[tokio::test]
    async fn crowded_session_is_fatal() {
        let mut harness = Harness::new("c");
        let err = harness
            .feed(EngineInput::Signaling(control(3, &[1, 2, 3])))
            .await
            .expect_err("three participants");
        assert!(matches!(err, NegotiationError::TooManyConnections(3)));
    }

    #[tokio::test]
    async fn closed_connection_is_recreated_with_channel() {
        let mut late = Harness::new("b");
        late.join(2, &[1, 2]).await.expect("join");
        late.connector.current().close().await.expect("close");
        late.pump().await.expect("recreate");

        let links = late.connector.links();
        assert_eq!(links.len(), 2);
        assert_eq!(late.engine.generation(), 2);
        assert_eq!(links[1].channels_created(), 1);
    }

    #[tokio::test]
    async fn stale_connection_events_are_ignored() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        let stale = early.connector.current();
        early.negotiate().await.expect("offer");
        early
            .feed(EngineInput::Signaling(SignalingMessage::Description(
                SessionDescription::offer("offer:b:1"),
            )))
            .await
            .expect("rollback");
        assert_eq!(early.engine.generation(), 2);
        early.sent_descriptions();

        stale.sink().emit(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        stale.sink().emit(PeerEvent::NegotiationNeeded);
        early.pump().await.expect("ignored");
        assert_eq!(early.connector.links().len(), 2);
        assert!(early.sent_descriptions().is_empty());
    }

    #[tokio::test]
    async fn failed_connection_is_closed_then_recreated() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        early
            .connector
            .current()
            .sink()
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Failed));
        early.pump().await.expect("recreate");
        let links = early.connector.links();
        assert_eq!(links.len(), 2);
        assert!(links[0].is_closed());
        assert!(!links[1].is_closed());
    }

    #[tokio::test]
    async fn channel_open_and_close_follow_connection() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        let link = early.connector.current();
        let channel = MockChannel::new("villas");
        let id = link.sink().next_channel_id();
        link.sink().emit(PeerEvent::ChannelOpened {
            id,
            channel: channel.clone(),
        });
        early.pump().await.expect("open");
        assert!(early.channel.is_open());

        link.sink().emit(PeerEvent::ChannelClosed { id });
        early.pump().await.expect("close");
        assert!(!early.channel.is_open());
        assert!(link.is_closed());
        assert_eq!(early.connector.links().len(), 2);
    }

    #[tokio::test]
    async fn offer_send_failure_is_fatal() {
        let mut late = Harness::new("b");
        late.signaling.set_failing(true);
        late.feed(EngineInput::Signaling(control(2, &[1, 2])))
            .await
            .expect("role");
        let err = late
            .feed(EngineInput::SignalingConnected)
            .await
            .expect_err("offer cannot be sent");
        assert!(matches!(err, NegotiationError::SendOffer(_)), "{err}");
        assert!(!late.engine.state().making_offer);
    }

    #[tokio::test]
    async fn connection_creation_failure_is_fatal() {
        let mut harness = Harness::new("a");
        harness.connector.fail_next();
        let err = harness
            .feed(EngineInput::SignalingConnected)
            .await
            .expect_err("connector refuses");
        assert!(matches!(err, NegotiationError::Create(_)));
    }

    #[tokio::test]
    async fn shutdown_closes_channel_and_connection() {
        let mut early = Harness::new("a");
        early.join(1, &[1, 2]).await.expect("join");
        let link = early.connector.current();
        let channel = MockChannel::new("villas");
        link.sink().emit(PeerEvent::ChannelOpened {
            id: link.sink().next_channel_id(),
            channel: channel.clone(),
        });
        early.pump().await.expect("open");

        early.engine.shutdown().await;
        assert!(channel.is_closed());
        assert!(link.is_closed());
        assert!(!early.channel.is_open());
    }
}
