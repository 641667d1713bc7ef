use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{read_exact_from, write_all_to, ByteSink, ByteSource};

/// Listening TCP endpoint producing byte streams.
#[derive(Debug)]
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind to `addr`. Port 0 picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let endpoint = format!("{addr:?}");
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            endpoint: endpoint.clone(),
            source,
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { endpoint, source })?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Block until a peer connects. Nagle is disabled on the accepted stream.
    pub fn accept(&self) -> Result<TcpStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(stream)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connect to a TCP endpoint with Nagle disabled.
pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<TcpStream> {
    let endpoint = format!("{addr:?}");
    let stream = TcpStream::connect(addr)
        .map_err(|source| TransportError::Connect { endpoint, source })?;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "connected over tcp");
    Ok(stream)
}

impl ByteSource for TcpStream {
    fn underlying_receive(&mut self, data: &mut [u8]) -> Result<()> {
        read_exact_from(self, data)
    }

    #[cfg(unix)]
    fn has_data(&mut self) -> Result<bool> {
        use std::os::fd::AsRawFd;
        crate::sys::poll_readable(self.as_raw_fd())
    }
}

impl ByteSink for TcpStream {
    fn underlying_send(&mut self, data: &[u8]) -> Result<()> {
        write_all_to(self, data)
    }
}
