use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use webrtc_node::logging::{self, LogConfig, LogLevel};
use webrtc_node::{Node, NodeRegistry};

#[derive(Debug, Parser)]
#[command(
    name = "webrtc-pipe",
    author,
    version,
    about = "Send stdin lines to a peer node and print what it sends back"
)]
struct Cli {
    /// Node type to instantiate.
    #[arg(long = "type", default_value = "webrtc")]
    node_type: String,

    /// JSON file holding the node configuration.
    #[arg(long, conflicts_with_all = ["session", "server"])]
    config: Option<PathBuf>,

    /// Session name shared with the peer.
    #[arg(long)]
    session: Option<String>,

    /// Signaling server URL.
    #[arg(long)]
    server: Option<String>,

    /// Return from start without waiting for the data channel.
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// List the registered node types and exit.
    #[arg(long, default_value_t = false)]
    list_types: bool,
}

impl Cli {
    fn node_config(&self) -> Result<Value> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?
            }
            None => {
                let mut config = json!({});
                if let Some(session) = &self.session {
                    config["session"] = json!(session);
                }
                if let Some(server) = &self.server {
                    config["server"] = json!(server);
                }
                config
            }
        };
        if self.no_wait {
            config
                .as_object_mut()
                .context("node configuration must be a JSON object")?
                .insert("wait".into(), json!(false));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let registry = NodeRegistry::with_defaults();
    if cli.list_types {
        for node_type in registry.types() {
            println!("{}\t{}", node_type.name, node_type.description);
        }
        return Ok(());
    }

    let node = registry
        .create(&cli.node_type, &cli.node_config()?)
        .context("failed to create node")?;
    info!(kind = node.kind(), details = %node.details(), "node created");

    let result = run(node.as_ref()).await;
    if let Err(err) = node.close().await {
        warn!(error = %err, "failed to close node");
    }
    result
}

async fn run(node: &dyn Node) -> Result<()> {
    node.prepare().await.context("prepare failed")?;
    node.start().await.context("start failed")?;
    info!(details = %node.details(), "node started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => node.write(Bytes::from(line)).await.context("write failed")?,
                    None => {
                        debug!("stdin closed");
                        break;
                    }
                }
            }
            payload = node.read() => {
                match payload.context("read failed")? {
                    Some(payload) => {
                        stdout.write_all(&payload).await?;
                        stdout.write_all(b"\n").await?;
                        stdout.flush().await?;
                    }
                    None => {
                        debug!("peer closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
        }
    }

    node.stop().await.context("stop failed")?;
    Ok(())
}
