//! Subscriber setup for the binaries. The library itself only emits events.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Replaces the computed filter entirely when set.
pub const FILTER_ENV: &str = "WEBRTC_LOG_FILTER";
/// Keeps dependency traces at trace level when truthy.
pub const TRACE_DEPS_ENV: &str = "WEBRTC_TRACE_DEPS";

const OWN_TARGETS: &[&str] = &["webrtc_node", "webrtc_relay", "webrtc_pipe", "signaling_proto"];

const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_mdns",
    "webrtc_srtp",
    "webrtc_data",
    "tokio_tungstenite",
    "tungstenite",
    "hyper",
    "hyper_util",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let directives = std::env::var(FILTER_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| directives_for(config.level, env_truthy(TRACE_DEPS_ENV)));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

/// Directives for `level`: our own crates at `level`, dependencies at most
/// `info` unless dependency traces are allowed.
fn directives_for(level: LogLevel, trace_deps: bool) -> String {
    let level_name = level.to_filter().to_string().to_lowercase();
    if level < LogLevel::Debug {
        return level_name;
    }

    let mut directives = vec!["info".to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level_name}")));
    if level == LogLevel::Trace && !trace_deps {
        directives.extend(NOISY_DEPENDENCIES.iter().map(|target| format!("{target}=info")));
    } else if level == LogLevel::Trace {
        directives[0] = level_name;
    }
    directives.join(",")
}
