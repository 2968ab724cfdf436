use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use webrtc_relay::session::SessionConfig;
use webrtc_relay::{serve_with_state, telemetry, AppState};

#[derive(Debug, Parser)]
#[command(
    name = "webrtc-relay",
    author,
    version,
    about = "Signaling relay for webrtc nodes"
)]
struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "WEBRTC_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    /// Frames buffered per connection before the relay starts dropping.
    #[arg(long, env = "WEBRTC_RELAY_BUFFER", default_value_t = 64)]
    buffer: usize,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "WEBRTC_RELAY_LOG", default_value = "info")]
    log_level: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "WEBRTC_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    session: SessionConfig,
    shutdown_grace: Duration,
}

impl TryFrom<&Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.buffer == 0 {
            anyhow::bail!("buffer must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            session: SessionConfig {
                per_connection_buffer: cli.buffer,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level)?;
    let config = ServerConfig::try_from(&cli)?;
    info!(
        listen_addr = %config.listen_addr,
        buffer = config.session.per_connection_buffer,
        "starting webrtc-relay"
    );
    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("webrtc-relay listening on {}", config.listen_addr);

    serve_with_state(listener, AppState::new(config.session), shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
