use bytes::{Buf, BufMut, BytesMut};
use wirecall_transport::{BufferError, FramePart, Result, TransportError};

use crate::crc::Crc16;

/// Frame header: payload length (4) + header CRC (2) + body CRC (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Identifies the separate header/body CRC layout below.
pub const FRAME_FORMAT_VERSION: u8 = 2;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Decoded frame header.
///
/// Wire format (all little-endian):
/// ```text
/// ┌──────────────┬──────────────┬──────────────┬──────────────────┐
/// │ Length (4B)  │ Header CRC   │ Body CRC     │ Payload          │
/// │              │ (2B)         │ (2B)         │ (Length bytes)   │
/// └──────────────┴──────────────┴──────────────┴──────────────────┘
/// ```
/// The header CRC covers the length bytes followed by the body CRC bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub header_crc: u16,
    pub body_crc: u16,
}

impl FrameHeader {
    /// Build the header protecting `payload`.
    pub fn seal(payload: &[u8], crc: &dyn Crc16) -> Result<Self> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut header = Self {
            payload_len,
            header_crc: 0,
            body_crc: crc.checksum(payload),
        };
        header.header_crc = header.header_checksum(crc);
        Ok(header)
    }

    /// CRC over the fields the header CRC slot protects.
    pub fn header_checksum(&self, crc: &dyn Crc16) -> u16 {
        let mut covered = [0u8; 6];
        let mut dst = &mut covered[..];
        dst.put_u32_le(self.payload_len);
        dst.put_u16_le(self.body_crc);
        crc.checksum(&covered)
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> std::result::Result<(), BufferError> {
        let available = dst.len();
        let Some(mut dst) = dst.get_mut(..HEADER_SIZE) else {
            return Err(BufferError::Overrun {
                requested: HEADER_SIZE,
                remaining: available,
            });
        };
        dst.put_u32_le(self.payload_len);
        dst.put_u16_le(self.header_crc);
        dst.put_u16_le(self.body_crc);
        Ok(())
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `src`. No CRC check.
    pub fn decode(src: &[u8]) -> std::result::Result<Self, BufferError> {
        let Some(mut src) = src.get(..HEADER_SIZE) else {
            return Err(BufferError::Overrun {
                requested: HEADER_SIZE,
                remaining: src.len(),
            });
        };
        Ok(Self {
            payload_len: src.get_u32_le(),
            header_crc: src.get_u16_le(),
            body_crc: src.get_u16_le(),
        })
    }

    pub fn verify_header(&self, crc: &dyn Crc16) -> Result<()> {
        let computed = self.header_checksum(crc);
        if computed != self.header_crc {
            return Err(TransportError::CrcCheckFailed {
                part: FramePart::Header,
                expected: self.header_crc,
                computed,
            });
        }
        Ok(())
    }

    pub fn verify_body(&self, body: &[u8], crc: &dyn Crc16) -> Result<()> {
        let computed = crc.checksum(body);
        if computed != self.body_crc {
            return Err(TransportError::CrcCheckFailed {
                part: FramePart::Body,
                expected: self.body_crc,
                computed,
            });
        }
        Ok(())
    }
}

/// Encode a complete frame for `payload` onto `dst`.
pub fn encode_frame(payload: &[u8], crc: &dyn Crc16, dst: &mut BytesMut) -> Result<FrameHeader> {
    let header = FrameHeader::seal(payload, crc)?;
    dst.reserve(HEADER_SIZE + payload.len());
    let start = dst.len();
    dst.put_bytes(0, HEADER_SIZE);
    header.encode(&mut dst[start..])?;
    dst.put_slice(payload);
    Ok(header)
}

/// Validate one complete frame held in `src`, returning its header and payload.
///
/// Fails if `src` is shorter than the declared frame or either CRC mismatches.
/// Trailing bytes after the frame are ignored.
pub fn decode_frame<'a>(src: &'a [u8], crc: &dyn Crc16) -> Result<(FrameHeader, &'a [u8])> {
    let header = FrameHeader::decode(src)?;
    header.verify_header(crc)?;
    let len = header.payload_len as usize;
    let body = src
        .get(HEADER_SIZE..HEADER_SIZE + len)
        .ok_or(BufferError::Overrun {
            requested: len,
            remaining: src.len() - HEADER_SIZE,
        })?;
    header.verify_body(body, crc)?;
    Ok((header, body))
}

/// Configuration for framed transports.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes, in either direction. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to socket-backed channels.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout applied to socket-backed channels.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
