//! Socket endpoints wrapped in CRC-framed transports.
//!
//! Accepted forms: `tcp://host:port`, `unix:///path/to.sock`, or a bare path
//! (Unix only).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(unix)]
use std::path::PathBuf;

use tracing::debug;
use wirecall_frame::{Crc16, FrameConfig, FramedTransport};
use wirecall_transport::{tcp, Result, TcpEndpoint, Transport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("endpoint must not be empty")]
    Empty,
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
}

/// Where to listen or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(EndpointParseError::Empty);
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        #[cfg(unix)]
        {
            let path = s.strip_prefix("unix://").unwrap_or(s);
            if path.is_empty() {
                return Err(EndpointParseError::Empty);
            }
            if let Some((scheme, _)) = path.split_once("://") {
                return Err(EndpointParseError::UnsupportedScheme(scheme.to_string()));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        }
        #[cfg(not(unix))]
        {
            let scheme = s.split_once("://").map_or(s, |(scheme, _)| scheme);
            Err(EndpointParseError::UnsupportedScheme(scheme.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl Endpoint {
    /// Connect and wrap the stream in a framed transport.
    pub fn connect(&self, crc: Arc<dyn Crc16>, config: FrameConfig) -> Result<Arc<dyn Transport>> {
        debug!(endpoint = %self, crc = crc.name(), "connecting");
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = wirecall_transport::uds::connect(path)?;
                Ok(Arc::new(FramedTransport::from_ipc(stream, config)?.with_crc(crc)))
            }
            Endpoint::Tcp(addr) => {
                let stream = tcp::connect(addr.as_str())?;
                Ok(Arc::new(FramedTransport::from_tcp(stream, config)?.with_crc(crc)))
            }
        }
    }

    pub fn bind(&self) -> Result<EndpointListener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(EndpointListener::Unix(
                wirecall_transport::UdsListener::bind(path)?,
            )),
            Endpoint::Tcp(addr) => Ok(EndpointListener::Tcp(TcpEndpoint::bind(addr.as_str())?)),
        }
    }
}

/// A bound endpoint handing out framed transports per connection.
#[derive(Debug)]
pub enum EndpointListener {
    #[cfg(unix)]
    Unix(wirecall_transport::UdsListener),
    Tcp(TcpEndpoint),
}

impl EndpointListener {
    /// Block for the next connection.
    pub fn accept(&self, crc: Arc<dyn Crc16>, config: FrameConfig) -> Result<Arc<dyn Transport>> {
        match self {
            #[cfg(unix)]
            EndpointListener::Unix(listener) => {
                let stream = listener.accept()?;
                Ok(Arc::new(FramedTransport::from_ipc(stream, config)?.with_crc(crc)))
            }
            EndpointListener::Tcp(listener) => {
                let stream = listener.accept()?;
                Ok(Arc::new(FramedTransport::from_tcp(stream, config)?.with_crc(crc)))
            }
        }
    }

    /// The endpoint as bound, with any ephemeral TCP port resolved.
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            EndpointListener::Unix(listener) => Endpoint::Unix(listener.path().to_path_buf()),
            EndpointListener::Tcp(listener) => Endpoint::Tcp(listener.local_addr().to_string()),
        }
    }
}
