//! Message headers and typed value encoding for wirecall.
//!
//! A [`Codec`] reads and writes one message inside a
//! [`MessageBuffer`](wirecall_transport::MessageBuffer), starting after the
//! bytes the transport chain reserves for its own framing. Generated service
//! stubs drive it field by field; this crate knows nothing about transports.

pub mod codec;
pub mod error;
pub mod factory;
pub mod message;

pub use codec::{BasicCodec, Codec};
pub use error::{CodecError, Result};
pub use factory::{BasicCodecFactory, CodecFactory};
pub use message::{MessageHeader, MessageType, MESSAGE_HEADER_SIZE, PROTOCOL_VERSION};
