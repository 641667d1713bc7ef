use tracing::trace;
use wirecall_transport::{BufferError, Cursor, MessageBuffer};

use crate::error::{CodecError, Result};
use crate::message::{MessageHeader, MessageType, PROTOCOL_VERSION};

/// Serializes typed values into, and out of, a [`MessageBuffer`].
///
/// An implementation supplies the raw byte access and header layout; the
/// typed primitives default to fixed-width little-endian encodings on top of
/// them, independent of host byte order. Aggregates (structs, lists, unions,
/// optionals) are laid out by generated stubs from these primitives plus the
/// list-length, union-discriminator and null-flag helpers.
///
/// Every read is bounded by the message length and every write by the buffer
/// capacity; running past either fails with [`BufferError::Overrun`].
pub trait Codec: Send {
    /// Write the message header at the start of the payload region.
    fn start_write_message(&mut self, header: &MessageHeader) -> Result<()>;

    /// Read and validate the message header.
    fn start_read_message(&mut self) -> Result<MessageHeader>;

    /// Append raw bytes.
    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Fill `dst` from the next bytes.
    fn read_data(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Bytes left to read in the message.
    fn remaining(&self) -> usize;

    /// Rewind to the start of the payload region, discarding written content.
    fn reset(&mut self) -> Result<()>;

    /// Swap in `buffer`, skipping `skip` reserved bytes; returns the old buffer.
    fn set_buffer(&mut self, buffer: MessageBuffer, skip: usize) -> Result<MessageBuffer>;

    fn buffer(&self) -> &MessageBuffer;

    fn buffer_mut(&mut self) -> &mut MessageBuffer;

    fn into_buffer(self: Box<Self>) -> MessageBuffer;

    /// Detach the buffer, leaving the codec over an empty placeholder.
    fn take_buffer(&mut self) -> MessageBuffer;

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_data(&[value])
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_data(&value.to_le_bytes())
    }

    /// Length-prefixed (u32) UTF-8 bytes.
    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes())
    }

    /// Length-prefixed (u32) bytes.
    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| BufferError::Overrun {
            requested: value.len(),
            remaining: self.buffer().capacity(),
        })?;
        self.write_u32(len)?;
        self.write_data(value)
    }

    fn start_write_list(&mut self, len: u32) -> Result<()> {
        self.write_u32(len)
    }

    fn start_write_union(&mut self, discriminator: i32) -> Result<()> {
        self.write_i32(discriminator)
    }

    /// Marks whether an optional value follows (`false`) or is absent (`true`).
    fn write_null_flag(&mut self, is_null: bool) -> Result<()> {
        self.write_bool(is_null)
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(read_array(self)?))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(read_array(self)?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(read_array(self)?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(read_array(self)?))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(read_array::<_, 1>(self)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(read_array(self)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(read_array(self)?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(read_array(self)?))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(read_array(self)?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(read_array(self)?))
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_binary()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Declared lengths are checked against the message before allocating.
    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(BufferError::Overrun {
                requested: len,
                remaining: self.remaining(),
            }
            .into());
        }
        let mut data = vec![0u8; len];
        self.read_data(&mut data)?;
        Ok(data)
    }

    fn start_read_list(&mut self) -> Result<u32> {
        self.read_u32()
    }

    fn start_read_union(&mut self) -> Result<i32> {
        self.read_i32()
    }

    /// Fails with [`CodecError::BadDiscriminator`] unless the flag byte is 0 or 1.
    fn read_null_flag(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::BadDiscriminator(i32::from(other))),
        }
    }
}

fn read_array<C: Codec + ?Sized, const N: usize>(codec: &mut C) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    codec.read_data(&mut out)?;
    Ok(out)
}

impl dyn Codec + '_ {
    /// Serialize `callback` as its index in `table`.
    pub fn write_callback<T: PartialEq>(&mut self, table: &[T], callback: &T) -> Result<()> {
        let index = table
            .iter()
            .position(|entry| entry == callback)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or(CodecError::UnknownCallback)?;
        self.write_u8(index)
    }

    /// Read a union discriminator and check it against the declared `cases`.
    pub fn read_union_case(&mut self, cases: &[i32]) -> Result<i32> {
        let discriminator = self.start_read_union()?;
        if cases.contains(&discriminator) {
            Ok(discriminator)
        } else {
            Err(CodecError::BadDiscriminator(discriminator))
        }
    }

    /// Resolve a serialized callback index against `table`.
    pub fn read_callback<'t, T>(&mut self, table: &'t [T]) -> Result<&'t T> {
        let index = self.read_u8()?;
        table
            .get(usize::from(index))
            .ok_or(CodecError::UnknownCallback)
    }
}

/// The default codec: header and primitives in little-endian byte order.
#[derive(Debug)]
pub struct BasicCodec {
    cursor: Cursor,
    start: usize,
}

impl BasicCodec {
    /// Codec over `buffer`, leaving the first `skip` bytes to the transport.
    pub fn new(buffer: MessageBuffer, skip: usize) -> Result<Self> {
        Ok(Self {
            cursor: Cursor::with_offset(buffer, skip)?,
            start: skip,
        })
    }

    /// Current absolute position in the buffer.
    pub fn position(&self) -> usize {
        self.cursor.position()
    }
}

impl Codec for BasicCodec {
    fn start_write_message(&mut self, header: &MessageHeader) -> Result<()> {
        self.write_u8(PROTOCOL_VERSION)?;
        self.write_u8(header.message_type as u8)?;
        self.write_u32(header.service)?;
        self.write_u32(header.method)?;
        self.write_u32(header.sequence)
    }

    fn start_read_message(&mut self) -> Result<MessageHeader> {
        let version = self.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::InvalidMessageVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }
        let message_type = MessageType::try_from(self.read_u8()?)?;
        let header = MessageHeader {
            message_type,
            service: self.read_u32()?,
            method: self.read_u32()?,
            sequence: self.read_u32()?,
        };
        trace!(?header, "message header read");
        Ok(header)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.cursor.write(data).map_err(Into::into)
    }

    fn read_data(&mut self, dst: &mut [u8]) -> Result<()> {
        self.cursor.read_into(dst).map_err(Into::into)
    }

    fn remaining(&self) -> usize {
        self.cursor.remaining_used()
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor.buffer_mut().set_len(self.start)?;
        self.cursor.seek(self.start)?;
        Ok(())
    }

    fn set_buffer(&mut self, buffer: MessageBuffer, skip: usize) -> Result<MessageBuffer> {
        let old = self.cursor.replace_buffer(buffer, skip)?;
        self.start = skip;
        Ok(old)
    }

    fn buffer(&self) -> &MessageBuffer {
        self.cursor.buffer()
    }

    fn buffer_mut(&mut self) -> &mut MessageBuffer {
        self.cursor.buffer_mut()
    }

    fn into_buffer(self: Box<Self>) -> MessageBuffer {
        self.cursor.into_buffer()
    }

    fn take_buffer(&mut self) -> MessageBuffer {
        self.start = 0;
        self.cursor.take_buffer()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;
    use wirecall_transport::Status;

    use super::*;
    use crate::message::MESSAGE_HEADER_SIZE;

    const RESERVED: usize = 8;

    fn writer(capacity: usize) -> BasicCodec {
        BasicCodec::new(MessageBuffer::with_capacity(capacity).unwrap(), RESERVED).unwrap()
    }

    fn reader_from(codec: BasicCodec) -> BasicCodec {
        let buffer = Box::new(codec).into_buffer();
        BasicCodec::new(buffer, RESERVED).unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader::new(MessageType::Invocation, 10, 2, 0xdead_beef);
        let mut codec = writer(64);
        codec.start_write_message(&header).unwrap();
        assert_eq!(codec.position(), RESERVED + MESSAGE_HEADER_SIZE);

        let mut codec = reader_from(codec);
        assert_eq!(codec.start_read_message().unwrap(), header);
    }

    #[test]
    fn header_bytes_are_fixed_order() {
        let mut codec = writer(64);
        codec
            .start_write_message(&MessageHeader::new(MessageType::Reply, 1, 2, 0x0403_0201))
            .unwrap();
        assert_eq!(
            &codec.buffer().as_slice()[RESERVED..],
            &[PROTOCOL_VERSION, 2, 1, 0, 0, 0, 2, 0, 0, 0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut codec = writer(64);
        codec
            .start_write_message(&MessageHeader::new(MessageType::Oneway, 1, 1, 1))
            .unwrap();
        codec.buffer_mut().write_at(RESERVED, &[PROTOCOL_VERSION + 1]).unwrap();

        let mut codec = reader_from(codec);
        assert_eq!(
            codec.start_read_message().unwrap_err(),
            CodecError::InvalidMessageVersion {
                found: PROTOCOL_VERSION + 1,
                expected: PROTOCOL_VERSION
            }
        );
    }

    #[test]
    fn primitives_roundtrip() {
        let mut codec = writer(128);
        codec.write_bool(true).unwrap();
        codec.write_i8(-5).unwrap();
        codec.write_i16(-300).unwrap();
        codec.write_i32(i32::MIN).unwrap();
        codec.write_i64(-1).unwrap();
        codec.write_u16(65_000).unwrap();
        codec.write_u64(u64::MAX).unwrap();
        codec.write_f32(1.5).unwrap();
        codec.write_f64(-2.25).unwrap();
        codec.write_string("héllo").unwrap();
        codec.write_binary(&[0, 1, 2]).unwrap();

        let mut codec = reader_from(codec);
        assert!(codec.read_bool().unwrap());
        assert_eq!(codec.read_i8().unwrap(), -5);
        assert_eq!(codec.read_i16().unwrap(), -300);
        assert_eq!(codec.read_i32().unwrap(), i32::MIN);
        assert_eq!(codec.read_i64().unwrap(), -1);
        assert_eq!(codec.read_u16().unwrap(), 65_000);
        assert_eq!(codec.read_u64().unwrap(), u64::MAX);
        assert_eq!(codec.read_f32().unwrap(), 1.5);
        assert_eq!(codec.read_f64().unwrap(), -2.25);
        assert_eq!(codec.read_string().unwrap(), "héllo");
        assert_eq!(codec.read_binary().unwrap(), vec![0, 1, 2]);
        assert_eq!(codec.remaining(), 0);
    }

    #[test]
    fn aggregates_roundtrip() {
        let mut codec = writer(64);
        codec.start_write_list(2).unwrap();
        codec.write_u32(7).unwrap();
        codec.write_u32(9).unwrap();
        codec.start_write_union(-1).unwrap();
        codec.write_null_flag(true).unwrap();

        let mut codec = reader_from(codec);
        let len = codec.start_read_list().unwrap();
        let items: Vec<u32> = (0..len).map(|_| codec.read_u32().unwrap()).collect();
        assert_eq!(items, vec![7, 9]);
        assert_eq!(codec.start_read_union().unwrap(), -1);
        assert!(codec.read_null_flag().unwrap());
    }

    // Capacity holds the reserved bytes plus exactly four payload bytes.
    #[rstest]
    #[case(3, true)]
    #[case(4, true)]
    #[case(5, false)]
    fn write_bounded_by_capacity(#[case] len: usize, #[case] fits: bool) {
        let mut codec = writer(RESERVED + 4);
        let result = codec.write_data(&vec![1u8; len]);
        assert_eq!(result.is_ok(), fits);
        if !fits {
            assert!(matches!(
                result,
                Err(CodecError::Buffer(BufferError::Overrun { .. }))
            ));
        }
    }

    #[rstest]
    #[case(3, true)]
    #[case(4, true)]
    #[case(5, false)]
    fn read_bounded_by_message_length(#[case] len: usize, #[case] fits: bool) {
        let mut codec = writer(64);
        codec.write_u32(0xffff_ffff).unwrap();
        let mut codec = reader_from(codec);
        let mut dst = vec![0u8; len];
        assert_eq!(codec.read_data(&mut dst).is_ok(), fits);
    }

    #[test]
    fn oversized_declared_length_fails_before_allocating() {
        let mut codec = writer(64);
        codec.write_u32(u32::MAX).unwrap();
        let mut codec = reader_from(codec);
        assert!(matches!(
            codec.read_binary(),
            Err(CodecError::Buffer(BufferError::Overrun { .. }))
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut codec = writer(64);
        codec.write_binary(&[0xff, 0xfe]).unwrap();
        let mut codec = reader_from(codec);
        assert_eq!(codec.read_string().unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn reset_discards_written_content() {
        let mut codec = writer(64);
        codec.write_u64(1).unwrap();
        codec.reset().unwrap();
        assert_eq!(codec.buffer().len(), RESERVED);
        assert_eq!(codec.position(), RESERVED);
    }

    #[test]
    fn set_buffer_returns_previous() {
        let mut codec = writer(64);
        codec.write_u8(9).unwrap();
        let old = codec
            .set_buffer(MessageBuffer::with_capacity(32).unwrap(), 0)
            .unwrap();
        assert_eq!(old.as_slice()[RESERVED], 9);
        assert_eq!(codec.position(), 0);
    }

    #[test]
    fn take_buffer_leaves_empty_placeholder() {
        let mut codec = writer(64);
        codec.write_u8(9).unwrap();
        let taken = codec.take_buffer();
        assert_eq!(taken.len(), RESERVED + 1);
        assert_eq!(codec.buffer().capacity(), 0);
        assert!(codec.write_u8(1).is_err());
    }

    #[test]
    fn callbacks_encode_table_index() {
        fn ping() -> u32 {
            1
        }
        fn pong() -> u32 {
            2
        }
        fn other() -> u32 {
            3
        }
        let table: [fn() -> u32; 2] = [ping, pong];

        let mut codec: Box<dyn Codec> = Box::new(writer(64));
        codec.write_callback(&table, &(pong as fn() -> u32)).unwrap();
        assert_eq!(
            codec.write_callback(&table, &(other as fn() -> u32)),
            Err(CodecError::UnknownCallback)
        );

        let mut codec: Box<dyn Codec> =
            Box::new(BasicCodec::new(codec.into_buffer(), RESERVED).unwrap());
        let callback = codec.read_callback(&table).unwrap();
        assert_eq!(callback(), 2);
    }

    #[test]
    fn unknown_callback_index_rejected() {
        let mut codec = writer(64);
        codec.write_u8(5).unwrap();
        let mut codec: Box<dyn Codec> = Box::new(reader_from(codec));
        assert_eq!(
            codec.read_callback(&[1u8, 2u8]).unwrap_err(),
            CodecError::UnknownCallback
        );
    }

    #[test]
    fn undeclared_discriminators_rejected() {
        let mut codec = writer(64);
        codec.start_write_union(3).unwrap();
        codec.start_write_union(9).unwrap();
        codec.write_u8(2).unwrap();

        let mut codec: Box<dyn Codec> = Box::new(reader_from(codec));
        assert_eq!(codec.read_union_case(&[1, 3]).unwrap(), 3);
        let err = codec.read_union_case(&[1, 3]).unwrap_err();
        assert_eq!(err, CodecError::BadDiscriminator(9));
        assert_eq!(err.status(), Status::InvalidArgument);
        assert_eq!(
            codec.read_null_flag().unwrap_err(),
            CodecError::BadDiscriminator(2)
        );
    }

    proptest! {
        #[test]
        fn strings_roundtrip(value in ".{0,64}") {
            let mut codec = writer(512);
            codec.write_string(&value).unwrap();
            let mut codec = reader_from(codec);
            prop_assert_eq!(codec.read_string().unwrap(), value);
        }
    }
}
