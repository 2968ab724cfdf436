use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use signaling_proto::SignalingMessage;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::{ConnectError, SendError};

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

type StateCallback = Box<dyn Fn() + Send + Sync>;
type MessageCallback = Box<dyn Fn(&SignalingMessage) + Send + Sync>;

/// Persistent, self-healing WebSocket connection to the rendezvous server.
///
/// Cloning yields another handle to the same connection. Subscribers are
/// invoked synchronously: connect callbacks once the transport is writable,
/// message callbacks in receipt order, disconnect callbacks after the
/// transport has been dropped.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    handshake_timeout: Duration,
    backoff: Mutex<ExponentialBackoff>,
    writer: AsyncMutex<Option<WsSink>>,
    done: Mutex<Option<watch::Receiver<bool>>>,
    closing: CancellationToken,
    reconnect: AsyncMutex<()>,
    on_connect: RwLock<Vec<StateCallback>>,
    on_disconnect: RwLock<Vec<StateCallback>>,
    on_message: RwLock<Vec<MessageCallback>>,
}

impl SignalingClient {
    pub fn new(url: Url, handshake_timeout: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                handshake_timeout,
                backoff: Mutex::new(ExponentialBackoff::new(backoff)),
                writer: AsyncMutex::new(None),
                done: Mutex::new(None),
                closing: CancellationToken::new(),
                reconnect: AsyncMutex::new(()),
                on_connect: RwLock::new(Vec::new()),
                on_disconnect: RwLock::new(Vec::new()),
                on_message: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.on_connect.write().push(Box::new(callback));
    }

    pub fn on_disconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect.write().push(Box::new(callback));
    }

    pub fn on_message(&self, callback: impl Fn(&SignalingMessage) + Send + Sync + 'static) {
        self.inner.on_message.write().push(Box::new(callback));
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.writer.lock().await.is_some()
    }

    /// Opens the transport once. Connect subscribers run before the read
    /// loop starts, so they observe a usable transport.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.is_closing() {
            return Err(ConnectError::Closing);
        }

        let url = &self.inner.url;
        let stream = match timeout(self.inner.handshake_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(source)) => {
                return Err(ConnectError::Dial {
                    url: url.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.inner.handshake_timeout.as_millis(),
                })
            }
        };
        debug!(url = %url, "signaling websocket connected");

        // A close() that raced the handshake has already seen an empty writer
        // and returned; the new transport must not outlive it.
        let mut writer = self.inner.writer.lock().await;
        if self.is_closing() {
            let mut stream = stream;
            match timeout(CLOSE_FRAME_TIMEOUT, stream.close(None)).await {
                Ok(Err(err)) => debug!(error = %err, "closing late signaling transport"),
                Err(_) => debug!("timed out closing late signaling transport"),
                Ok(Ok(())) => {}
            }
            return Err(ConnectError::Closing);
        }

        let (sink, stream) = stream.split();
        *writer = Some(sink);
        let (done_tx, done_rx) = watch::channel(false);
        *self.inner.done.lock() = Some(done_rx);
        drop(writer);

        for callback in self.inner.on_connect.read().iter() {
            callback();
        }

        tokio::spawn(read_loop(self.clone(), stream, done_tx));
        self.inner.backoff.lock().reset();
        Ok(())
    }

    /// Retries [`connect`](Self::connect) until it succeeds or the client is
    /// closed. Concurrent callers are serialized; a caller that finds the
    /// transport already up returns immediately.
    pub async fn connect_with_backoff(&self) -> Result<(), ConnectError> {
        let _guard = self.inner.reconnect.lock().await;
        loop {
            if self.is_closing() {
                return Err(ConnectError::Closing);
            }
            if self.is_connected().await {
                return Ok(());
            }

            let delay = self.inner.backoff.lock().current();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.inner.closing.cancelled() => return Err(ConnectError::Closing),
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(ConnectError::Closing) => return Err(ConnectError::Closing),
                Err(err) => {
                    let next = self.inner.backoff.lock().next();
                    warn!(
                        url = %self.inner.url,
                        error = %err,
                        retry_in_ms = next.as_millis() as u64,
                        "failed to connect signaling; retrying"
                    );
                }
            }
        }
    }

    pub async fn send_message(&self, message: &SignalingMessage) -> Result<(), SendError> {
        let text = message.to_json()?;
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(SendError::NotConnected)?;
        trace!(kind = message.kind(), len = text.len(), "sending signaling message");
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Requests a graceful close. Always succeeds from the caller's point of
    /// view; a peer that never acknowledges only produces a warning.
    pub async fn close(&self) {
        if self.is_closing() {
            debug!("signaling client already closing");
            return;
        }
        // Stops any pending reconnect even when no transport is open.
        self.inner.closing.cancel();

        {
            let mut writer = self.inner.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                return;
            };
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            match timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to send signaling close frame"),
                Err(_) => warn!("timed out sending signaling close frame"),
            }
        }

        let done = self.inner.done.lock().clone();
        let Some(mut done) = done else {
            return;
        };
        let completed = timeout(CLOSE_COMPLETION_TIMEOUT, async move {
            done.wait_for(|closed| *closed).await.map(|_| ())
        })
        .await;
        match completed {
            Ok(_) => info!(url = %self.inner.url, "signaling connection closed"),
            Err(_) => warn!("timed out waiting for signaling connection to close"),
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, len = text.len(), "dropping malformed signaling message");
                return;
            }
        };
        debug!(kind = message.kind(), "received signaling message");
        for callback in self.inner.on_message.read().iter() {
            callback(&message);
        }
    }

    /// Runs once per transport, after its read loop ends.
    async fn finish(&self, done: watch::Sender<bool>) {
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            match timeout(CLOSE_FRAME_TIMEOUT, sink.close()).await {
                Ok(Err(err)) => debug!(error = %err, "signaling sink close"),
                Err(_) => debug!("timed out closing signaling sink"),
                Ok(Ok(())) => {}
            }
        }

        for callback in self.inner.on_disconnect.read().iter() {
            callback();
        }
        done.send_replace(true);

        if self.is_closing() {
            info!(url = %self.inner.url, "signaling connection finished");
            return;
        }

        warn!(
            url = %self.inner.url,
            retry_in_ms = self.inner.backoff.lock().current().as_millis() as u64,
            "signaling connection lost; reconnecting"
        );
        redial::spawn(self.clone());
    }
}

// Kept outside the async fns above: spawning the reconnect from inside their
// bodies makes the `Send` check on `connect` depend on itself.
mod redial {
    use tracing::debug;

    use super::SignalingClient;

    pub(super) fn spawn(client: SignalingClient) {
        tokio::spawn(async move {
            if let Err(err) = client.connect_with_backoff().await {
                debug!(error = %err, "reconnect loop ended");
            }
        });
    }
}

async fn read_loop(client: SignalingClient, mut stream: SplitStream<WsStream>, done: watch::Sender<bool>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => client.dispatch(&text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => client.dispatch(&text),
                Err(err) => warn!(error = %err, "dropping non-utf8 signaling frame"),
            },
            Ok(Message::Close(frame)) => {
                match frame.as_ref().map(|frame| frame.code) {
                    None | Some(CloseCode::Normal) | Some(CloseCode::Away) => {
                        debug!("signaling websocket closed by peer")
                    }
                    Some(code) => warn!(code = u16::from(code), "signaling websocket closed abnormally"),
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("signaling websocket closed: {err}");
                    }
                    _ => warn!("signaling websocket error: {err}"),
                }
                break;
            }
        }
    }
    client.finish(done).await;
}
