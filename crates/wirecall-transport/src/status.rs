//! Status codes shared by every wirecall layer.
//!
//! The numeric values are part of the wire contract: a server writes them into
//! the status word of every reply, so both peers must agree on the table.

use std::fmt;

/// Outcome of an RPC operation, as seen by callers and remote peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Fail = 1,
    InvalidArgument = 4,
    Timeout = 5,
    InvalidMessageVersion = 6,
    ExpectedReply = 7,
    CrcCheckFailed = 8,
    BufferOverrun = 9,
    UnknownName = 10,
    ConnectionFailure = 11,
    ConnectionClosed = 12,
    MemoryError = 13,
    ServerIsDown = 14,
    InitFailed = 15,
    ReceiveFailed = 16,
    SendFailed = 17,
    UnknownCallback = 18,
    NestedCallFailure = 19,
}

impl Status {
    /// Numeric code carried on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire status code. Unknown codes collapse to [`Status::Fail`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            4 => Self::InvalidArgument,
            5 => Self::Timeout,
            6 => Self::InvalidMessageVersion,
            7 => Self::ExpectedReply,
            8 => Self::CrcCheckFailed,
            9 => Self::BufferOverrun,
            10 => Self::UnknownName,
            11 => Self::ConnectionFailure,
            12 => Self::ConnectionClosed,
            13 => Self::MemoryError,
            14 => Self::ServerIsDown,
            15 => Self::InitFailed,
            16 => Self::ReceiveFailed,
            17 => Self::SendFailed,
            18 => Self::UnknownCallback,
            19 => Self::NestedCallFailure,
            _ => Self::Fail,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::InvalidArgument => "InvalidArgument",
            Self::Timeout => "Timeout",
            Self::InvalidMessageVersion => "InvalidMessageVersion",
            Self::ExpectedReply => "ExpectedReply",
            Self::CrcCheckFailed => "CrcCheckFailed",
            Self::BufferOverrun => "BufferOverrun",
            Self::UnknownName => "UnknownName",
            Self::ConnectionFailure => "ConnectionFailure",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::MemoryError => "MemoryError",
            Self::ServerIsDown => "ServerIsDown",
            Self::InitFailed => "InitFailed",
            Self::ReceiveFailed => "ReceiveFailed",
            Self::SendFailed => "SendFailed",
            Self::UnknownCallback => "UnknownCallback",
            Self::NestedCallFailure => "NestedCallFailure",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}
