//! Rendezvous server for the signaling channel. Every WebSocket path names a
//! session; text frames from one member are relayed to the others and every
//! membership change is announced as a `control` roster.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub mod session;
pub mod telemetry;

use session::{SessionConfig, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    registry: SessionRegistry,
}

impl AppState {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    active_connections: usize,
    total_messages_relayed: u64,
    total_messages_dropped: u64,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    session: String,
    connections: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .fallback(ws_handler)
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve_with_state(listener, AppState::default(), shutdown).await
}

pub async fn serve_with_state<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.snapshot();
    let totals = state.registry.totals();
    Json(StatsResponse {
        active_sessions: sessions.len(),
        active_connections: sessions.iter().map(|s| s.connections).sum(),
        total_messages_relayed: totals.relayed,
        total_messages_dropped: totals.dropped,
        sessions: sessions
            .into_iter()
            .map(|s| SessionStatsEntry {
                session: s.session,
                connections: s.connections,
            })
            .collect(),
    })
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session = session_key(&uri);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| handle_connection(socket, state, session, remote, user_agent))
}

fn session_key(uri: &Uri) -> String {
    uri.path().trim_matches('/').to_string()
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    session: String,
    remote: SocketAddr,
    user_agent: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let registration = state
        .registry
        .join(&session, remote.to_string(), user_agent);
    let connection_id = registration.connection_id;
    let mut outbound = registration.receiver;
    info!(
        session = %session,
        connection_id,
        remote = %remote,
        members = registration.members,
        "member joined"
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Close(frame)) => {
                debug!(
                    session = %session,
                    connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "member closed websocket"
                );
                break;
            }
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                let outcome = state.registry.relay(&session, connection_id, message);
                debug!(
                    session = %session,
                    connection_id,
                    delivered = outcome.delivered,
                    dropped = outcome.dropped,
                    "relayed frame"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(session = %session, connection_id, error = %err, "error receiving frame");
                break;
            }
        }
    }

    let remaining = state.registry.leave(&session, connection_id);
    writer.abort();
    info!(session = %session, connection_id, remaining, "member left");
}
