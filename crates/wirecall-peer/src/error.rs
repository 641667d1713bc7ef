use wirecall_codec::{CodecError, MessageType};
use wirecall_transport::{BufferError, Status, TransportError};

/// Errors surfaced by clients, servers and the arbitrator.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message contents could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The reply does not answer the request it was matched to.
    #[error("expected reply to sequence {expected}, got {message_type} with sequence {found}")]
    ExpectedReply {
        expected: u32,
        found: u32,
        message_type: MessageType,
    },

    /// No service with this id is registered.
    #[error("unknown service {service}")]
    UnknownName { service: u32 },

    /// The service does not implement this method.
    #[error("service {service} has no method {method}")]
    UnknownMethod { service: u32, method: u32 },

    /// A service with this id is already registered.
    #[error("service {0} is already registered")]
    DuplicateService(u32),

    /// The call reached the peer and the peer reported a failure.
    #[error("remote call failed: {status} (code {code})")]
    Remote { status: Status, code: u32 },

    /// The server has been stopped.
    #[error("server is down")]
    ServerIsDown,

    /// A two-way call from inside a handler on the thread that receives its
    /// reply would wait forever.
    #[error("nested call from a handler on the receiving thread")]
    NestedCallFailure,

    /// Every pending-client slot is in use.
    #[error("pending client list full ({capacity} slots)")]
    PendingListFull { capacity: usize },

    /// No reply arrived within the configured timeout.
    #[error("timed out waiting for reply")]
    Timeout,

    /// A handler or caller passed a value the call cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<BufferError> for RpcError {
    fn from(err: BufferError) -> Self {
        RpcError::Transport(TransportError::Buffer(err))
    }
}

/// Coarse classification for deciding how to react to an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The channel failed or timed out.
    Transport,
    /// A frame or message failed validation.
    Integrity,
    /// The peers disagree about the protocol.
    Protocol,
    /// Buffers or slots ran out.
    Resource,
    /// The remote handler reported failure.
    Remote,
    /// The local API was used incorrectly.
    Usage,
}

impl RpcError {
    /// Status code for this error, as written into failed replies.
    pub fn status(&self) -> Status {
        match self {
            RpcError::Transport(err) => err.status(),
            RpcError::Codec(err) => err.status(),
            RpcError::ExpectedReply { .. } => Status::ExpectedReply,
            RpcError::UnknownName { .. } | RpcError::UnknownMethod { .. } => Status::UnknownName,
            RpcError::DuplicateService(_) | RpcError::InvalidArgument(_) => {
                Status::InvalidArgument
            }
            RpcError::Remote { status, .. } => *status,
            RpcError::ServerIsDown => Status::ServerIsDown,
            RpcError::NestedCallFailure => Status::NestedCallFailure,
            RpcError::PendingListFull { .. } => Status::MemoryError,
            RpcError::Timeout => Status::Timeout,
        }
    }

    /// Status code written into a failed reply. A remote failure keeps the
    /// code it arrived with, including codes this side does not know.
    pub fn reply_code(&self) -> u32 {
        match self {
            RpcError::Remote { code, .. } => *code,
            other => other.status().code(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Remote { .. } => ErrorKind::Remote,
            RpcError::DuplicateService(_)
            | RpcError::InvalidArgument(_)
            | RpcError::ServerIsDown
            | RpcError::NestedCallFailure => ErrorKind::Usage,
            RpcError::PendingListFull { .. } => ErrorKind::Resource,
            _ => match self.status() {
                Status::CrcCheckFailed | Status::BufferOverrun => ErrorKind::Integrity,
                Status::MemoryError => ErrorKind::Resource,
                Status::InvalidMessageVersion
                | Status::ExpectedReply
                | Status::UnknownName
                | Status::UnknownCallback
                | Status::InvalidArgument => ErrorKind::Protocol,
                _ => ErrorKind::Transport,
            },
        }
    }

    /// Whether the underlying channel is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Transport(err) if err.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        RpcError::Transport(TransportError::ConnectionClosed),
        ErrorKind::Transport,
        Status::ConnectionClosed
    )]
    #[case(RpcError::Timeout, ErrorKind::Transport, Status::Timeout)]
    #[case(
        RpcError::Transport(TransportError::CrcCheckFailed {
            part: wirecall_transport::FramePart::Body,
            expected: 1,
            computed: 2,
        }),
        ErrorKind::Integrity,
        Status::CrcCheckFailed
    )]
    #[case(
        RpcError::Codec(CodecError::Buffer(BufferError::Overrun { requested: 4, remaining: 0 })),
        ErrorKind::Integrity,
        Status::BufferOverrun
    )]
    #[case(
        RpcError::Codec(CodecError::InvalidMessageVersion { found: 9, expected: 1 }),
        ErrorKind::Protocol,
        Status::InvalidMessageVersion
    )]
    #[case(RpcError::UnknownName { service: 3 }, ErrorKind::Protocol, Status::UnknownName)]
    #[case(
        RpcError::ExpectedReply { expected: 1, found: 2, message_type: MessageType::Reply },
        ErrorKind::Protocol,
        Status::ExpectedReply
    )]
    #[case(
        RpcError::from(BufferError::Allocation { capacity: 8 }),
        ErrorKind::Resource,
        Status::MemoryError
    )]
    #[case(RpcError::PendingListFull { capacity: 4 }, ErrorKind::Resource, Status::MemoryError)]
    #[case(RpcError::Remote { status: Status::Fail, code: 1 }, ErrorKind::Remote, Status::Fail)]
    #[case(RpcError::NestedCallFailure, ErrorKind::Usage, Status::NestedCallFailure)]
    fn taxonomy(#[case] err: RpcError, #[case] kind: ErrorKind, #[case] status: Status) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.status(), status);
    }

    #[test]
    fn reply_code_keeps_unknown_remote_codes() {
        let remote = RpcError::Remote {
            status: Status::from_code(77),
            code: 77,
        };
        assert_eq!(remote.reply_code(), 77);
        assert_eq!(RpcError::Timeout.reply_code(), Status::Timeout.code());
    }

    #[test]
    fn only_broken_channels_are_fatal() {
        assert!(RpcError::Transport(TransportError::ConnectionClosed).is_fatal());
        assert!(!RpcError::Timeout.is_fatal());
        assert!(!RpcError::UnknownName { service: 1 }.is_fatal());
    }
}
