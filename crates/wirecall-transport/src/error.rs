use std::path::PathBuf;

use crate::status::Status;

/// Errors raised by [`MessageBuffer`](crate::MessageBuffer) cursors and factories.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A read or write span runs past the end of the buffer.
    #[error("buffer overrun: {requested} bytes requested, {remaining} remaining")]
    Overrun { requested: usize, remaining: usize },

    /// Owned storage for a buffer could not be obtained.
    #[error("failed to allocate message buffer of {capacity} bytes")]
    Allocation { capacity: usize },
}

impl BufferError {
    pub fn status(&self) -> Status {
        match self {
            BufferError::Overrun { .. } => Status::BufferOverrun,
            BufferError::Allocation { .. } => Status::MemoryError,
        }
    }
}

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified endpoint.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {}", path.display())]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The medium did not accept an outgoing message.
    #[error("send failed: {0}")]
    SendFailed(std::io::Error),

    /// The medium failed while delivering an incoming message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer closed the channel.
    #[error("connection closed")]
    ConnectionClosed,

    /// No complete message arrived within the configured timeout.
    #[error("transport operation timed out")]
    Timeout,

    /// A frame failed its integrity check.
    #[error("crc check failed on frame {part} (expected {expected:#06x}, got {computed:#06x})")]
    CrcCheckFailed {
        part: FramePart,
        expected: u16,
        computed: u16,
    },

    /// A frame declared a payload larger than the receiving buffer.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Buffer bounds or allocation failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Any other I/O error on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which part of a frame failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePart {
    Header,
    Body,
}

impl std::fmt::Display for FramePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramePart::Header => f.write_str("header"),
            FramePart::Body => f.write_str("body"),
        }
    }
}

impl TransportError {
    /// Status code reported to callers for this error.
    pub fn status(&self) -> Status {
        match self {
            TransportError::Bind { .. }
            | TransportError::Connect { .. }
            | TransportError::Accept(_)
            | TransportError::PathTooLong { .. } => Status::ConnectionFailure,
            TransportError::SendFailed(_) => Status::SendFailed,
            TransportError::ReceiveFailed(_) | TransportError::FrameTooLarge { .. } => {
                Status::ReceiveFailed
            }
            TransportError::ConnectionClosed => Status::ConnectionClosed,
            TransportError::Timeout => Status::Timeout,
            TransportError::CrcCheckFailed { .. } => Status::CrcCheckFailed,
            TransportError::Buffer(err) => err.status(),
            TransportError::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Status::Timeout,
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => Status::ConnectionClosed,
                _ => Status::Fail,
            },
        }
    }

    /// Whether the channel is unusable after this error.
    ///
    /// Integrity failures and timeouts leave the channel open; the next
    /// receive may succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.status(),
            Status::ConnectionClosed | Status::ConnectionFailure | Status::SendFailed
        ) || matches!(self, TransportError::ReceiveFailed(_))
    }

    /// Classify an I/O error from a byte-oriented receive.
    pub fn from_receive_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout
            }
            _ => TransportError::ReceiveFailed(err.to_string()),
        }
    }

    /// Classify an I/O error from a byte-oriented send.
    pub fn from_send_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::WriteZero => TransportError::ConnectionClosed,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout
            }
            _ => TransportError::SendFailed(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
