use wirecall_transport::{BufferError, Status};

/// Errors raised while encoding or decoding message contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A read or write ran past the buffer or the message.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The peer speaks a different protocol version.
    #[error("unsupported message version {found} (expected {expected})")]
    InvalidMessageVersion { found: u8, expected: u8 },

    /// The message type byte is not one of the known types.
    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    /// A string field did not hold UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A callback is not present in the callback table.
    #[error("callback not found in table")]
    UnknownCallback,

    /// A union discriminator or enum value outside the declared range.
    #[error("unexpected discriminator {0}")]
    BadDiscriminator(i32),
}

impl CodecError {
    pub fn status(&self) -> Status {
        match self {
            CodecError::Buffer(err) => err.status(),
            CodecError::InvalidMessageVersion { .. } | CodecError::InvalidMessageType(_) => {
                Status::InvalidMessageVersion
            }
            CodecError::InvalidUtf8 | CodecError::BadDiscriminator(_) => Status::InvalidArgument,
            CodecError::UnknownCallback => Status::UnknownCallback,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
