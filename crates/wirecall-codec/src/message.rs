//! Message header carried at the start of every payload.
//!
//! Wire format (little-endian):
//! ```text
//! ┌─────────┬──────┬──────────────┬──────────────┬──────────────┐
//! │ Version │ Type │ Service (4B) │ Method (4B)  │ Sequence (4B)│
//! │ (1B)    │ (1B) │              │              │              │
//! └─────────┴──────┴──────────────┴──────────────┴──────────────┘
//! ```

use std::fmt;

use crate::error::CodecError;

/// Version written into, and required of, every message header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 14;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A call expecting a reply.
    Invocation = 0,
    /// A call with no reply.
    Oneway = 1,
    Reply = 2,
    /// Unsolicited out-of-band message. Not dispatched.
    Notification = 3,
}

impl MessageType {
    /// Whether a server receiving this message dispatches it.
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::Invocation | MessageType::Oneway)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Invocation),
            1 => Ok(MessageType::Oneway),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Notification),
            other => Err(CodecError::InvalidMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Invocation => "invocation",
            MessageType::Oneway => "oneway",
            MessageType::Reply => "reply",
            MessageType::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Routing fields of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub service: u32,
    pub method: u32,
    pub sequence: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, service: u32, method: u32, sequence: u32) -> Self {
        Self {
            message_type,
            service,
            method,
            sequence,
        }
    }

    /// The reply header answering this request.
    pub fn reply(&self) -> Self {
        Self {
            message_type: MessageType::Reply,
            ..*self
        }
    }
}
