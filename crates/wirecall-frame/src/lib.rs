//! CRC-protected framing for byte channels that cannot delimit messages.
//!
//! Every message is framed with:
//! - a 4-byte little-endian payload length
//! - a 2-byte CRC-16 over the length and body CRC
//! - a 2-byte CRC-16 over the payload
//!
//! A corrupted header fails the receive before any body bytes are read; a
//! corrupted body fails after. Neither is recovered mid-stream.

pub mod codec;
pub mod crc;
pub mod transport;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, FrameHeader, DEFAULT_MAX_PAYLOAD,
    FRAME_FORMAT_VERSION, HEADER_SIZE,
};
pub use self::crc::{Crc16, LegacyCrc16, NoCrc, XmodemCrc16};
pub use transport::{memory_pair, FramedTransport, MemoryFramedTransport};
