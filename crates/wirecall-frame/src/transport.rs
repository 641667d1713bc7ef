use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, warn};
use wirecall_transport::{
    pipe, BufferError, ByteSink, ByteSource, IpcStream, MessageBuffer, PipeReader, PipeWriter,
    Result, Transport, TransportError,
};

use crate::codec::{FrameConfig, FrameHeader, HEADER_SIZE};
use crate::crc::{Crc16, XmodemCrc16};

/// Turns a raw byte channel into a [`Transport`] delivering whole, validated
/// messages.
///
/// The first [`HEADER_SIZE`] bytes of every buffer are reserved for the frame
/// header, which is written in place so the payload never moves. Sends and
/// receives hold separate locks: one thread can block in `receive` while others
/// send, and concurrent senders are serialized frame by frame.
pub struct FramedTransport<R, W> {
    source: Mutex<R>,
    sink: Mutex<W>,
    crc: Arc<dyn Crc16>,
    config: FrameConfig,
}

impl<R: ByteSource, W: ByteSink> FramedTransport<R, W> {
    /// Frame over `source`/`sink` with default configuration and XMODEM CRC.
    pub fn new(source: R, sink: W) -> Self {
        Self::with_config(source, sink, FrameConfig::default())
    }

    pub fn with_config(source: R, sink: W, config: FrameConfig) -> Self {
        Self {
            source: Mutex::new(source),
            sink: Mutex::new(sink),
            crc: Arc::new(XmodemCrc16),
            config,
        }
    }

    /// Replace the CRC strategy. Both peers must agree on it.
    pub fn with_crc(mut self, crc: Arc<dyn Crc16>) -> Self {
        self.crc = crc;
        self
    }

    pub fn crc(&self) -> &dyn Crc16 {
        self.crc.as_ref()
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn lock_source(&self) -> MutexGuard<'_, R> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sink(&self) -> MutexGuard<'_, W> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Largest payload a receive into `message` may accept.
    fn receive_limit(&self, message: &MessageBuffer) -> usize {
        (message.capacity() - HEADER_SIZE).min(self.config.max_payload_size)
    }
}

impl<R: ByteSource, W: ByteSink> Transport for FramedTransport<R, W> {
    fn send(&self, message: &mut MessageBuffer) -> Result<()> {
        if message.len() < HEADER_SIZE {
            return Err(BufferError::Overrun {
                requested: HEADER_SIZE,
                remaining: message.len(),
            }
            .into());
        }
        let payload_len = message.len() - HEADER_SIZE;
        if payload_len > self.config.max_payload_size {
            return Err(TransportError::FrameTooLarge {
                size: payload_len,
                max: self.config.max_payload_size,
            });
        }

        let header = FrameHeader::seal(&message.as_slice()[HEADER_SIZE..], self.crc.as_ref())?;
        header.encode(message.storage_mut())?;

        self.lock_sink().underlying_send(message.as_slice())?;
        debug!(
            payload_len,
            body_crc = header.body_crc,
            "frame sent"
        );
        Ok(())
    }

    fn receive(&self, message: &mut MessageBuffer) -> Result<()> {
        message.reset();
        if message.capacity() < HEADER_SIZE {
            return Err(BufferError::Overrun {
                requested: HEADER_SIZE,
                remaining: message.capacity(),
            }
            .into());
        }
        let limit = self.receive_limit(message);

        let header = {
            let mut source = self.lock_source();
            let storage = message.storage_mut();
            source.underlying_receive(&mut storage[..HEADER_SIZE])?;
            let header = FrameHeader::decode(storage)?;
            if let Err(err) = header.verify_header(self.crc.as_ref()) {
                warn!(error = %err, "dropping frame with corrupt header");
                return Err(err);
            }

            let size = header.payload_len as usize;
            if size > self.config.max_payload_size {
                // Too large to skip: the link cannot be resynchronized.
                warn!(
                    size,
                    max = self.config.max_payload_size,
                    "frame exceeds max payload; abandoning stream"
                );
                return Err(TransportError::ReceiveFailed(format!(
                    "frame of {size} bytes exceeds max payload of {} bytes",
                    self.config.max_payload_size
                )));
            }
            if size > limit {
                discard(&mut *source, &mut storage[..], size)?;
                warn!(size, max = limit, "frame exceeds receive buffer; discarded");
                return Err(TransportError::FrameTooLarge { size, max: limit });
            }
            source.underlying_receive(&mut storage[HEADER_SIZE..HEADER_SIZE + size])?;
            header
        };

        let end = HEADER_SIZE + header.payload_len as usize;
        let body = &message.storage_mut()[HEADER_SIZE..end];
        if let Err(err) = header.verify_body(body, self.crc.as_ref()) {
            warn!(error = %err, "dropping frame with corrupt body");
            return Err(err);
        }
        message.set_len(end)?;
        debug!(payload_len = header.payload_len, "frame received");
        Ok(())
    }

    /// Non-blocking. Reports `false` while another thread is mid-receive.
    fn has_message(&self) -> bool {
        match self.source.try_lock() {
            Ok(mut source) => source.has_data().unwrap_or(true),
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().has_data().unwrap_or(true)
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    fn reserve_header_size(&self) -> usize {
        HEADER_SIZE
    }
}

/// Read and drop `len` bytes, using `scratch` as the landing area.
fn discard<R>(source: &mut R, scratch: &mut [u8], mut len: usize) -> Result<()>
where
    R: ByteSource + ?Sized,
{
    while len > 0 {
        let chunk = len.min(scratch.len());
        source.underlying_receive(&mut scratch[..chunk])?;
        len -= chunk;
    }
    Ok(())
}

impl FramedTransport<IpcStream, IpcStream> {
    /// Frame over a connected socket stream, splitting it into receive and
    /// send halves and applying the configured timeouts.
    pub fn from_ipc(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        let sink = stream.try_clone()?;
        Ok(Self::with_config(stream, sink, config))
    }
}

impl FramedTransport<std::net::TcpStream, std::net::TcpStream> {
    pub fn from_tcp(stream: std::net::TcpStream, config: FrameConfig) -> Result<Self> {
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        let sink = stream.try_clone()?;
        Ok(Self::with_config(stream, sink, config))
    }
}

/// In-process framed link over byte pipes.
pub type MemoryFramedTransport = FramedTransport<PipeReader, PipeWriter>;

/// Two framed transports connected back to back through in-memory pipes.
pub fn memory_pair(config: FrameConfig) -> (MemoryFramedTransport, MemoryFramedTransport) {
    let (a_tx, b_rx) = pipe();
    let (b_tx, a_rx) = pipe();
    (
        FramedTransport::with_config(a_rx, a_tx, config.clone()),
        FramedTransport::with_config(b_rx, b_tx, config),
    )
}

impl<R, W> std::fmt::Debug for FramedTransport<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("crc", &self.crc.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use proptest::prelude::*;
    use wirecall_transport::FramePart;

    use super::*;
    use crate::codec::encode_frame;
    use crate::crc::{LegacyCrc16, NoCrc};

    const CAPACITY: usize = 256;

    fn message(payload: &[u8]) -> MessageBuffer {
        let mut buffer = MessageBuffer::with_capacity(CAPACITY).unwrap();
        buffer.set_len(HEADER_SIZE).unwrap();
        buffer.write_at(HEADER_SIZE, payload).unwrap();
        buffer
    }

    fn payload_of(buffer: &MessageBuffer) -> &[u8] {
        &buffer.as_slice()[HEADER_SIZE..]
    }

    fn raw_receiver() -> (PipeWriter, MemoryFramedTransport) {
        let (raw_tx, rx) = pipe();
        let (tx, _unused_rx) = pipe();
        (raw_tx, FramedTransport::new(rx, tx))
    }

    #[test]
    fn send_receive_roundtrip() {
        let (a, b) = memory_pair(FrameConfig::default());
        a.send(&mut message(b"hello frame")).unwrap();

        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        b.receive(&mut out).unwrap();
        assert_eq!(payload_of(&out), b"hello frame");
        assert_eq!(a.reserve_header_size(), HEADER_SIZE);
    }

    #[test]
    fn header_written_in_place() {
        let (a, _b) = memory_pair(FrameConfig::default());
        let mut msg = message(&[0x01, 0x02, 0x03]);
        a.send(&mut msg).unwrap();
        let header = FrameHeader::decode(msg.as_slice()).unwrap();
        assert_eq!(header.payload_len, 3);
        assert_eq!(header.body_crc, 0x6131);
        assert_eq!(payload_of(&msg), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn flipped_first_payload_bit_is_rejected() {
        let mut wire = BytesMut::new();
        encode_frame(&[0x01, 0x02, 0x03], &XmodemCrc16, &mut wire).unwrap();
        wire[HEADER_SIZE] ^= 0x01;

        let (mut raw, framed) = raw_receiver();
        raw.underlying_send(&wire).unwrap();

        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        let err = framed.receive(&mut out).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CrcCheckFailed {
                part: FramePart::Body,
                ..
            }
        ));
    }

    #[test]
    fn corrupt_header_fails_before_body_read() {
        let mut wire = BytesMut::new();
        encode_frame(b"body", &XmodemCrc16, &mut wire).unwrap();
        wire[1] ^= 0x80;

        let (mut raw, framed) = raw_receiver();
        raw.underlying_send(&wire).unwrap();

        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        let err = framed.receive(&mut out).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CrcCheckFailed {
                part: FramePart::Header,
                ..
            }
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut wire = BytesMut::new();
        encode_frame(&[7u8; 64], &XmodemCrc16, &mut wire).unwrap();

        let (mut raw, framed) = raw_receiver();
        raw.underlying_send(&wire).unwrap();

        let mut small = MessageBuffer::with_capacity(HEADER_SIZE + 16).unwrap();
        let err = framed.receive(&mut small).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 64, max: 16 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn frame_after_oversized_one_arrives_intact() {
        let (a, b) = memory_pair(FrameConfig::default());
        a.send(&mut message(&[9u8; 100])).unwrap();
        a.send(&mut message(b"next")).unwrap();

        let mut small = MessageBuffer::with_capacity(HEADER_SIZE + 16).unwrap();
        assert!(matches!(
            b.receive(&mut small),
            Err(TransportError::FrameTooLarge { size: 100, max: 16 })
        ));
        b.receive(&mut small).unwrap();
        assert_eq!(payload_of(&small), b"next");
    }

    #[test]
    fn frame_beyond_max_payload_is_fatal() {
        let mut wire = BytesMut::new();
        encode_frame(&[7u8; 64], &XmodemCrc16, &mut wire).unwrap();

        let (mut raw, rx) = pipe();
        let (tx, _unused_rx) = pipe();
        let framed = FramedTransport::with_config(
            rx,
            tx,
            FrameConfig {
                max_payload_size: 32,
                ..FrameConfig::default()
            },
        );
        raw.underlying_send(&wire).unwrap();

        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        let err = framed.receive(&mut out).unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[test]
    fn send_respects_max_payload() {
        let config = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let (a, _b) = memory_pair(config);
        let err = a.send(&mut message(b"too long")).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 8, max: 4 }));
    }

    #[test]
    fn send_without_header_room_is_overrun() {
        let (a, _b) = memory_pair(FrameConfig::default());
        let mut short = MessageBuffer::with_capacity(CAPACITY).unwrap();
        short.write_at(0, b"abc").unwrap();
        assert!(matches!(
            a.send(&mut short),
            Err(TransportError::Buffer(BufferError::Overrun { .. }))
        ));
    }

    #[test]
    fn peers_with_different_crc_disagree() {
        let (a, b) = memory_pair(FrameConfig::default());
        let b = b.with_crc(Arc::new(LegacyCrc16));
        a.send(&mut message(b"x")).unwrap();
        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        assert!(matches!(
            b.receive(&mut out),
            Err(TransportError::CrcCheckFailed { .. })
        ));
    }

    #[test]
    fn disabled_crc_roundtrip() {
        let (a, b) = memory_pair(FrameConfig::default());
        let a = a.with_crc(Arc::new(NoCrc));
        let b = b.with_crc(Arc::new(NoCrc));
        a.send(&mut message(b"trusted link")).unwrap();
        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        b.receive(&mut out).unwrap();
        assert_eq!(payload_of(&out), b"trusted link");
    }

    #[test]
    fn has_message_tracks_pending_bytes() {
        let (a, b) = memory_pair(FrameConfig::default());
        assert!(!b.has_message());
        a.send(&mut message(b"poll me")).unwrap();
        assert!(b.has_message());
    }

    #[test]
    fn send_proceeds_while_receive_blocks() {
        let (a, b) = memory_pair(FrameConfig::default());
        let a = Arc::new(a);

        let receiver = {
            let a = Arc::clone(&a);
            std::thread::spawn(move || {
                let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
                a.receive(&mut out).map(|()| payload_of(&out).to_vec())
            })
        };
        std::thread::sleep(Duration::from_millis(20));

        a.send(&mut message(b"outbound")).unwrap();
        let mut got = MessageBuffer::with_capacity(CAPACITY).unwrap();
        b.receive(&mut got).unwrap();
        assert_eq!(payload_of(&got), b"outbound");

        b.send(&mut message(b"inbound")).unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), b"inbound");
    }

    #[test]
    fn concurrent_senders_do_not_interleave() {
        let (a, b) = memory_pair(FrameConfig::default());
        let a = Arc::new(a);

        let senders: Vec<_> = (0..4u8)
            .map(|id| {
                let a = Arc::clone(&a);
                std::thread::spawn(move || {
                    for n in 0..16u8 {
                        a.send(&mut message(&[id; 32][..usize::from(n) + 1])).unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        for _ in 0..64 {
            b.receive(&mut out).unwrap();
            let payload = payload_of(&out);
            assert!(payload.iter().all(|&byte| byte == payload[0]));
        }
    }

    #[test]
    fn peer_close_surfaces_connection_closed() {
        let (a, b) = memory_pair(FrameConfig::default());
        drop(a);
        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        assert!(matches!(
            b.receive(&mut out),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    #[cfg(unix)]
    fn framed_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let config = FrameConfig {
            read_timeout: Some(Duration::from_secs(5)),
            ..FrameConfig::default()
        };
        let a = FramedTransport::from_ipc(left, config.clone()).unwrap();
        let b = FramedTransport::from_ipc(right, config).unwrap();

        a.send(&mut message(b"over uds")).unwrap();
        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        b.receive(&mut out).unwrap();
        assert_eq!(payload_of(&out), b"over uds");
    }

    #[test]
    #[cfg(unix)]
    fn socket_read_timeout_surfaces() {
        let (left, right) = IpcStream::pair().unwrap();
        let config = FrameConfig {
            read_timeout: Some(Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let _a = FramedTransport::from_ipc(left, config.clone()).unwrap();
        let b = FramedTransport::from_ipc(right, config).unwrap();
        let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
        assert!(matches!(b.receive(&mut out), Err(TransportError::Timeout)));
    }

    proptest! {
        #[test]
        fn roundtrip_law(
            payload in proptest::collection::vec(any::<u8>(), 0..=CAPACITY - HEADER_SIZE)
        ) {
            let (a, b) = memory_pair(FrameConfig::default());
            a.send(&mut message(&payload)).unwrap();
            let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
            b.receive(&mut out).unwrap();
            prop_assert_eq!(payload_of(&out), payload.as_slice());
        }

        #[test]
        fn single_bit_flip_in_payload_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..128),
            bit in any::<prop::sample::Index>(),
        ) {
            let mut wire = BytesMut::new();
            encode_frame(&payload, &XmodemCrc16, &mut wire).unwrap();
            let flip = bit.index(payload.len() * 8);
            wire[HEADER_SIZE + flip / 8] ^= 1 << (flip % 8);

            let (mut raw, framed) = raw_receiver();
            raw.underlying_send(&wire).unwrap();
            let mut out = MessageBuffer::with_capacity(CAPACITY).unwrap();
            let is_body_crc_failure = matches!(
                framed.receive(&mut out),
                Err(TransportError::CrcCheckFailed { part: FramePart::Body, .. })
            );
            prop_assert!(is_body_crc_failure);
        }
    }
}
