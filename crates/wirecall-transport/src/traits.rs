use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use tracing::trace;

use crate::buffer::MessageBuffer;
use crate::error::{Result, TransportError};

/// Capability to move whole messages over a channel.
///
/// Implementations are shared between threads: sends and receives take
/// `&self` and serialize internally. Decorators (framing, arbitration) wrap
/// another `Transport` and forward to it.
///
/// A message occupies `message.as_slice()`. The first
/// [`reserve_header_size`](Transport::reserve_header_size) bytes of that slice
/// belong to the transport chain; payload starts after them.
pub trait Transport: Send + Sync {
    /// Transmit one complete message.
    ///
    /// Transports may write their framing into the reserved header region of
    /// `message`, which is why the buffer is borrowed mutably.
    fn send(&self, message: &mut MessageBuffer) -> Result<()>;

    /// Block until one complete message is available and store it in `message`.
    ///
    /// On success `message.len()` covers the reserved header region plus payload.
    fn receive(&self, message: &mut MessageBuffer) -> Result<()>;

    /// Non-blocking poll: whether [`receive`](Transport::receive) would find data.
    fn has_message(&self) -> bool {
        true
    }

    /// Receive one message only if one is already pending.
    ///
    /// Returns `Ok(false)` without touching `message` when nothing is waiting.
    /// Decorators that consume some messages themselves override this so a
    /// consumed message also yields `Ok(false)` instead of blocking for the
    /// next one.
    fn try_receive(&self, message: &mut MessageBuffer) -> Result<bool> {
        if !self.has_message() {
            return Ok(false);
        }
        self.receive(message)?;
        Ok(true)
    }

    /// Leading bytes of each buffer reserved for this transport chain's framing.
    fn reserve_header_size(&self) -> usize {
        0
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: &mut MessageBuffer) -> Result<()> {
        (**self).send(message)
    }

    fn receive(&self, message: &mut MessageBuffer) -> Result<()> {
        (**self).receive(message)
    }

    fn has_message(&self) -> bool {
        (**self).has_message()
    }

    fn try_receive(&self, message: &mut MessageBuffer) -> Result<bool> {
        (**self).try_receive(message)
    }

    fn reserve_header_size(&self) -> usize {
        (**self).reserve_header_size()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, message: &mut MessageBuffer) -> Result<()> {
        (**self).send(message)
    }

    fn receive(&self, message: &mut MessageBuffer) -> Result<()> {
        (**self).receive(message)
    }

    fn has_message(&self) -> bool {
        (**self).has_message()
    }

    fn try_receive(&self, message: &mut MessageBuffer) -> Result<bool> {
        (**self).try_receive(message)
    }

    fn reserve_header_size(&self) -> usize {
        (**self).reserve_header_size()
    }
}

/// Receiving half of a raw byte channel (UART, SPI, socket, ...).
///
/// The channel cannot delimit messages itself; a framing layer asks for an
/// exact number of bytes at a time.
pub trait ByteSource: Send {
    /// Fill `data` completely or fail.
    fn underlying_receive(&mut self, data: &mut [u8]) -> Result<()>;

    /// Whether bytes are pending without blocking.
    fn has_data(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Sending half of a raw byte channel.
pub trait ByteSink: Send {
    /// Write all of `data` or fail.
    fn underlying_send(&mut self, data: &[u8]) -> Result<()>;
}

/// Adapts any blocking `Read`/`Write` stream into a byte channel half.
#[derive(Debug)]
pub struct IoChannel<T> {
    inner: T,
}

impl<T> IoChannel<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Send> ByteSource for IoChannel<T> {
    fn underlying_receive(&mut self, data: &mut [u8]) -> Result<()> {
        read_exact_from(&mut self.inner, data)
    }
}

impl<T: Write + Send> ByteSink for IoChannel<T> {
    fn underlying_send(&mut self, data: &[u8]) -> Result<()> {
        write_all_to(&mut self.inner, data)
    }
}

/// Read exactly `data.len()` bytes, retrying interrupted reads.
///
/// EOF before the span is complete is reported as a closed connection.
pub fn read_exact_from<R: Read + ?Sized>(reader: &mut R, data: &mut [u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        match reader.read(&mut data[offset..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::from_receive_io(err)),
        }
    }
    trace!(len = data.len(), "byte channel receive");
    Ok(())
}

/// Write all of `data` and flush, retrying interrupted writes.
///
/// An expired socket write timeout surfaces as `WouldBlock` on Unix and
/// `TimedOut` elsewhere; both fail with [`TransportError::Timeout`].
pub fn write_all_to<W: Write + ?Sized>(writer: &mut W, data: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        match writer.write(&data[offset..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::from_send_io(err)),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::from_send_io(err)),
        }
    }
    trace!(len = data.len(), "byte channel send");
    Ok(())
}

/// A connected local IPC stream implementing `Read` and `Write`.
///
/// On Unix, this wraps a Unix domain socket stream.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl ByteSource for IpcStream {
    fn underlying_receive(&mut self, data: &mut [u8]) -> Result<()> {
        read_exact_from(self, data)
    }

    fn has_data(&mut self) -> Result<bool> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                use std::os::fd::AsRawFd;
                crate::sys::poll_readable(stream.as_raw_fd())
            }
        }
    }
}

impl ByteSink for IpcStream {
    fn underlying_send(&mut self, data: &[u8]) -> Result<()> {
        write_all_to(self, data)
    }
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    /// A connected pair of streams, for loopback use.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    ///
    /// Used to split one connection into the receive and send halves of a
    /// framed transport.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Shut down both directions, unblocking any thread in a receive.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => f.debug_struct("IpcStream").field("type", &"unix").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct OneByteAtATime {
        bytes: Vec<u8>,
        pos: usize,
        interrupted: bool,
    }

    impl Read for OneByteAtATime {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn read_exact_assembles_partial_reads() {
        let mut source = IoChannel::new(OneByteAtATime {
            bytes: b"frame".to_vec(),
            pos: 0,
            interrupted: false,
        });
        let mut out = [0u8; 5];
        source.underlying_receive(&mut out).unwrap();
        assert_eq!(&out, b"frame");
    }

    #[test]
    fn eof_mid_span_is_connection_closed() {
        let mut source = IoChannel::new(Cursor::new(vec![1u8, 2]));
        let mut out = [0u8; 4];
        let err = source.underlying_receive(&mut out).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[test]
    fn zero_write_is_connection_closed() {
        struct ZeroWriter;
        impl Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut sink = IoChannel::new(ZeroWriter);
        let err = sink.underlying_send(b"x").unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[test]
    #[cfg(unix)]
    fn ipc_stream_pair_roundtrip_and_poll() {
        let (mut left, mut right) = IpcStream::pair().unwrap();
        assert!(!right.has_data().unwrap());

        left.underlying_send(b"ping").unwrap();
        assert!(right.has_data().unwrap());

        let mut out = [0u8; 4];
        right.underlying_receive(&mut out).unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    #[cfg(unix)]
    fn ipc_stream_read_timeout_maps_to_timeout() {
        let (_left, mut right) = IpcStream::pair().unwrap();
        right
            .set_read_timeout(Some(std::time::Duration::from_millis(10)))
            .unwrap();
        let mut out = [0u8; 1];
        let err = right.underlying_receive(&mut out).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    #[cfg(unix)]
    fn ipc_stream_write_timeout_maps_to_timeout() {
        let (mut left, _right) = IpcStream::pair().unwrap();
        left.set_write_timeout(Some(std::time::Duration::from_millis(50)))
            .unwrap();
        // Far more than the socket buffer holds, with nobody reading.
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let data = vec![0u8; 16 * 1024 * 1024];
            let _ = done.send(left.underlying_send(&data));
        });
        let outcome = finished
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("send kept retrying past its write timeout");
        assert!(matches!(outcome, Err(TransportError::Timeout)));
    }
}
