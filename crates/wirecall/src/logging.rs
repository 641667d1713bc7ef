//! Diagnostic logging to stderr.
//!
//! Each protocol layer logs under its own crate target, so `--log-level`
//! applies to all of them and `--trace-layer` raises a single layer to trace
//! without flooding the output with the others.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive. When set it replaces the
/// directives built from `--log-level` and `--trace-layer`.
pub const LOG_ENV: &str = "WIRECALL_LOG";

/// Crates whose events follow `--log-level`. Everything else logs warnings only.
const CRATE_TARGETS: [&str; 5] = [
    "wirecall",
    "wirecall_transport",
    "wirecall_frame",
    "wirecall_codec",
    "wirecall_peer",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Protocol layer that can be traced on its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Layer {
    /// Byte channels, sockets and in-memory pipes.
    Transport,
    /// Frame headers and CRC checks.
    Frame,
    /// Message headers and field encoding.
    Codec,
    /// Clients, servers, the arbitrator and the receive pump.
    Peer,
}

impl Layer {
    fn target(self) -> &'static str {
        match self {
            Layer::Transport => "wirecall_transport",
            Layer::Frame => "wirecall_frame",
            Layer::Codec => "wirecall_codec",
            Layer::Peer => "wirecall_peer",
        }
    }
}

/// Filter directives for `level` across the wirecall crates, with each layer
/// in `traced` raised to trace.
fn directives(level: LogLevel, traced: &[Layer]) -> String {
    let mut parts = vec!["warn".to_string()];
    parts.extend(
        CRATE_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.directive())),
    );
    parts.extend(
        traced
            .iter()
            .map(|layer| format!("{}=trace", layer.target())),
    );
    parts.join(",")
}

fn filter(level: LogLevel, traced: &[Layer]) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(directives(level, traced)))
}

pub fn init_logging(format: LogFormat, level: LogLevel, traced: &[Layer]) {
    // Targets tell the layers apart once more than info is shown.
    let verbose = level >= LogLevel::Debug || !traced.is_empty();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter(level, traced))
        .with_ansi(false)
        .with_target(verbose)
        .with_thread_names(verbose);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
