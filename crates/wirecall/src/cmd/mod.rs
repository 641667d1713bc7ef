use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use wirecall::frame::{Crc16, LegacyCrc16, NoCrc, XmodemCrc16};
use wirecall::Endpoint;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod frame;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo echo service.
    Serve(ServeArgs),
    /// Call a method on a running echo service.
    Call(CallArgs),
    /// Encode or check a single frame offline.
    Frame(FrameArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Frame(args) => frame::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Frame checksum selected on the command line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CrcKind {
    /// CRC-16/XMODEM.
    #[default]
    Xmodem,
    /// CRC-16/XMODEM seeded with 0xEF4A, for older firmware.
    Legacy,
    /// No checksum; both CRC slots carry zero.
    None,
}

impl CrcKind {
    pub fn strategy(self) -> Arc<dyn Crc16> {
        match self {
            CrcKind::Xmodem => Arc::new(XmodemCrc16),
            CrcKind::Legacy => Arc::new(LegacyCrc16),
            CrcKind::None => Arc::new(NoCrc),
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind: a socket path, `unix://PATH` or `tcp://HOST:PORT`.
    pub endpoint: Endpoint,
    /// Frame checksum.
    #[arg(long, value_enum, default_value_t)]
    pub crc: CrcKind,
    /// Exit after the first connection closes.
    #[arg(long)]
    pub once: bool,
    /// Sleep between polls of an idle connection (e.g. 20ms, 1s).
    #[arg(long, default_value = "20ms")]
    pub poll_interval: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CallMethod {
    /// Return the joined arguments unchanged.
    Echo,
    /// Add two 32-bit integers.
    Add,
    /// Send the joined arguments as a oneway notification.
    Notify,
    /// Ask the server to fail with the given status code.
    Fail,
}

impl CallMethod {
    pub fn name(self) -> &'static str {
        match self {
            CallMethod::Echo => "echo",
            CallMethod::Add => "add",
            CallMethod::Notify => "notify",
            CallMethod::Fail => "fail",
        }
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to.
    pub endpoint: Endpoint,
    /// Method to call.
    #[arg(value_enum)]
    pub method: CallMethod,
    /// Method arguments: everything after the method name, options included.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
    /// Reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Frame checksum.
    #[arg(long, value_enum, default_value_t)]
    pub crc: CrcKind,
}

#[derive(Args, Debug)]
pub struct FrameArgs {
    #[command(subcommand)]
    pub action: FrameAction,
}

#[derive(Subcommand, Debug)]
pub enum FrameAction {
    /// Wrap a payload in a frame and print it.
    Encode(FrameEncodeArgs),
    /// Verify a hex-encoded frame and print its payload.
    Decode(FrameDecodeArgs),
}

#[derive(Args, Debug)]
pub struct FrameEncodeArgs {
    /// Payload as a UTF-8 string.
    #[arg(long, conflicts_with = "hex")]
    pub data: Option<String>,
    /// Payload as hex digits.
    #[arg(long, conflicts_with = "data")]
    pub hex: Option<String>,
    /// Frame checksum.
    #[arg(long, value_enum, default_value_t)]
    pub crc: CrcKind,
}

#[derive(Args, Debug)]
pub struct FrameDecodeArgs {
    /// Complete frame as hex digits.
    pub hex: String,
    /// Frame checksum.
    #[arg(long, value_enum, default_value_t)]
    pub crc: CrcKind,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn crc_kinds_map_to_strategies() {
        assert_eq!(CrcKind::Xmodem.strategy().name(), "xmodem");
        assert_eq!(CrcKind::Legacy.strategy().name(), "legacy");
        assert_eq!(CrcKind::None.strategy().name(), "none");
    }
}
