//! The interface a host process drives nodes through, and the WebRTC node.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{ConnectError, NodeError};
use crate::peer::{PeerConnection, PeerConnector, RtcConnector};

/// Operations every node type supports. Calls made out of lifecycle order
/// fail with [`NodeError::InvalidState`].
#[async_trait]
pub trait Node: Send + Sync {
    /// Registered type tag, e.g. `"webrtc"`.
    fn kind(&self) -> &'static str;
    async fn prepare(&self) -> Result<(), NodeError>;
    async fn start(&self) -> Result<(), NodeError>;
    async fn stop(&self) -> Result<(), NodeError>;
    /// Next inbound payload; `Ok(None)` marks end of stream.
    async fn read(&self) -> Result<Option<Bytes>, NodeError>;
    async fn write(&self, payload: Bytes) -> Result<(), NodeError>;
    async fn close(&self) -> Result<(), NodeError>;
    fn details(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Prepared,
    Started,
    Stopped,
    Closed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Prepared => "prepared",
            NodeState::Started => "started",
            NodeState::Stopped => "stopped",
            NodeState::Closed => "closed",
        }
    }
}

/// Lifecycle bookkeeping shared by node types: the current state and the
/// stop signal that ends pending reads and waits.
pub struct NodeLifecycle {
    state: Mutex<NodeState>,
    stop: CancellationToken,
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::Created),
            stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Fails unless the node is in one of `allowed`.
    pub fn expect(&self, allowed: &[NodeState]) -> Result<NodeState, NodeError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(NodeError::InvalidState(state.as_str()))
        }
    }

    pub fn prepared(&self) -> Result<(), NodeError> {
        self.advance(&[NodeState::Created], NodeState::Prepared)
    }

    pub fn started(&self) -> Result<(), NodeError> {
        self.advance(&[NodeState::Prepared], NodeState::Started)
    }

    /// Fires the stop signal. Returns `false` if the node was already stopped.
    pub fn stopped(&self) -> Result<bool, NodeError> {
        let mut state = self.state.lock();
        match *state {
            NodeState::Stopped => Ok(false),
            NodeState::Closed => Err(NodeError::InvalidState(NodeState::Closed.as_str())),
            NodeState::Created | NodeState::Prepared | NodeState::Started => {
                *state = NodeState::Stopped;
                self.stop.cancel();
                Ok(true)
            }
        }
    }

    /// Returns the state the node was in before closing.
    pub fn closed(&self) -> NodeState {
        let mut state = self.state.lock();
        self.stop.cancel();
        std::mem::replace(&mut *state, NodeState::Closed)
    }

    fn advance(&self, from: &[NodeState], to: NodeState) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            return Err(NodeError::InvalidState(state.as_str()));
        }
        *state = to;
        Ok(())
    }
}

/// Node exchanging payloads with one remote peer over a WebRTC data channel.
pub struct WebRtcNode {
    config: NodeConfig,
    lifecycle: NodeLifecycle,
    connector: Mutex<Option<Arc<dyn PeerConnector>>>,
    connection: Mutex<Option<Arc<PeerConnection>>>,
}

impl WebRtcNode {
    pub const KIND: &'static str = "webrtc";

    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            lifecycle: NodeLifecycle::new(),
            connector: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    /// Uses `connector` instead of the `webrtc-rs` stack.
    pub fn with_connector(config: NodeConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let node = Self::new(config);
        *node.connector.lock() = Some(connector);
        node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.channel().is_open())
    }

    fn connection(&self) -> Result<Arc<PeerConnection>, NodeError> {
        self.connection
            .lock()
            .clone()
            .ok_or(NodeError::InvalidState(self.lifecycle.state().as_str()))
    }

    fn session_failure(connection: &PeerConnection) -> Option<NodeError> {
        connection.failure().map(NodeError::SessionFailed)
    }

    async fn teardown(&self) {
        let connection = self.connection.lock().clone();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }
}

#[async_trait]
impl Node for WebRtcNode {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn prepare(&self) -> Result<(), NodeError> {
        self.lifecycle.expect(&[NodeState::Created])?;

        let injected = self.connector.lock().clone();
        let connector: Arc<dyn PeerConnector> = match injected {
            Some(connector) => connector,
            None => Arc::new(RtcConnector::new(&self.config.ice_servers).map_err(NodeError::Setup)?),
        };
        let connection = Arc::new(PeerConnection::new(
            &self.config,
            connector,
            self.lifecycle.stop_token().clone(),
        )?);

        {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                match connection.connect().await {
                    Ok(()) => {}
                    Err(ConnectError::Closing) => debug!("signaling closed before connecting"),
                    Err(err) => warn!(error = %err, "signaling connect loop ended"),
                }
            });
        }

        *self.connection.lock() = Some(connection);
        self.lifecycle.prepared()?;
        info!(details = %self.details(), "webrtc node prepared");
        Ok(())
    }

    async fn start(&self) -> Result<(), NodeError> {
        self.lifecycle.expect(&[NodeState::Prepared])?;
        let connection = self.connection()?;

        if self.config.wait {
            info!("waiting until data channel is connected");
            if !connection
                .channel()
                .wait_connected(self.lifecycle.stop_token())
                .await
            {
                return Err(Self::session_failure(&connection)
                    .unwrap_or(NodeError::InvalidState(self.lifecycle.state().as_str())));
            }
        }

        self.lifecycle.started()
    }

    async fn stop(&self) -> Result<(), NodeError> {
        if self.lifecycle.stopped()? {
            self.teardown().await;
            info!(session = %self.config.session, "webrtc node stopped");
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<Bytes>, NodeError> {
        self.lifecycle.expect(&[
            NodeState::Prepared,
            NodeState::Started,
            NodeState::Stopped,
        ])?;
        let connection = self.connection()?;
        let payload = connection.channel().read(self.lifecycle.stop_token()).await;
        match payload {
            Some(payload) => Ok(Some(payload)),
            None => match Self::session_failure(&connection) {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    async fn write(&self, payload: Bytes) -> Result<(), NodeError> {
        self.lifecycle
            .expect(&[NodeState::Prepared, NodeState::Started])?;
        let connection = self.connection()?;
        if let Some(err) = Self::session_failure(&connection) {
            return Err(err);
        }
        if !connection.channel().write(payload).await? {
            debug!("no data channel open; skipped payload");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NodeError> {
        match self.lifecycle.closed() {
            NodeState::Closed | NodeState::Stopped => {}
            NodeState::Created | NodeState::Prepared | NodeState::Started => {
                self.teardown().await;
            }
        }
        self.connection.lock().take();
        Ok(())
    }

    fn details(&self) -> String {
        format!("server={}, session={}", self.config.server, self.config.session)
    }
}
