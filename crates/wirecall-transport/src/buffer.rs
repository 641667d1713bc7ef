//! Fixed-capacity message buffers and bounds-checked cursors.
//!
//! A [`MessageBuffer`] is the unit handed between codec and transport. Its
//! storage never grows: the capacity chosen at allocation is the largest
//! message it can carry, including any header bytes reserved by the
//! transport chain. Every span access is checked and fails with
//! [`BufferError::Overrun`] instead of truncating.
//!
//! Invariant: `cursor position <= len() <= capacity()` after every write, and
//! reads never pass `len()`.

use crate::error::BufferError;

/// Owned or adopted byte region with a used-length marker.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    data: Box<[u8]>,
    used: usize,
    wrapped: bool,
}

impl MessageBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self, BufferError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| BufferError::Allocation { capacity })?;
        data.resize(capacity, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            used: 0,
            wrapped: false,
        })
    }

    /// Adopt a region provided by a transport without copying it.
    ///
    /// The whole region counts as used. Factories drop wrapped buffers on
    /// dispose instead of returning them to a pool.
    pub fn wrap(region: Vec<u8>) -> Self {
        let used = region.len();
        Self {
            data: region.into_boxed_slice(),
            used,
            wrapped: true,
        }
    }

    /// Total bytes of storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently holding message data.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Whether this buffer adopts a region it was not allocated with.
    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Set the used length, bounded by capacity.
    pub fn set_len(&mut self, used: usize) -> Result<(), BufferError> {
        if used > self.capacity() {
            return Err(BufferError::Overrun {
                requested: used,
                remaining: self.capacity(),
            });
        }
        self.used = used;
        Ok(())
    }

    /// Mark the buffer empty without touching its storage.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// The used portion of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The whole storage region, for transports filling the buffer in place.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `dst.len()` bytes starting at `offset`, bounded by the used length.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        let end = checked_end(offset, dst.len(), self.used)?;
        dst.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    /// Copy `src` into the buffer at `offset`, bounded by capacity.
    ///
    /// The used length grows to cover the written span.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<(), BufferError> {
        let end = checked_end(offset, src.len(), self.capacity())?;
        self.data[offset..end].copy_from_slice(src);
        self.used = self.used.max(end);
        Ok(())
    }

    /// Copy the used contents of `other` into this buffer.
    pub fn copy_from(&mut self, other: &MessageBuffer) -> Result<(), BufferError> {
        if other.used > self.capacity() {
            return Err(BufferError::Overrun {
                requested: other.used,
                remaining: self.capacity(),
            });
        }
        self.data[..other.used].copy_from_slice(other.as_slice());
        self.used = other.used;
        Ok(())
    }

    /// Exchange storage with `other`.
    pub fn swap(&mut self, other: &mut MessageBuffer) {
        std::mem::swap(self, other);
    }

    /// Consume the buffer, returning its used bytes.
    pub fn into_vec(self) -> Vec<u8> {
        let mut data = self.data.into_vec();
        data.truncate(self.used);
        data
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("wrapped", &self.wrapped)
            .finish()
    }
}

fn checked_end(offset: usize, len: usize, limit: usize) -> Result<usize, BufferError> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(end),
        _ => Err(BufferError::Overrun {
            requested: len,
            remaining: limit.saturating_sub(offset),
        }),
    }
}

/// Sequential reader/writer over an owned [`MessageBuffer`].
///
/// Writes are bounded by capacity; reads are bounded by the used length,
/// i.e. the declared size of the message in the buffer.
#[derive(Debug)]
pub struct Cursor {
    buffer: MessageBuffer,
    pos: usize,
}

impl Cursor {
    /// Position a cursor at the start of `buffer`.
    pub fn new(buffer: MessageBuffer) -> Self {
        Self { buffer, pos: 0 }
    }

    /// Position a cursor `offset` bytes into `buffer`, skipping reserved header space.
    pub fn with_offset(buffer: MessageBuffer, offset: usize) -> Result<Self, BufferError> {
        let mut cursor = Self::new(buffer);
        cursor.seek(offset)?;
        Ok(cursor)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move to an absolute position within capacity.
    pub fn seek(&mut self, pos: usize) -> Result<(), BufferError> {
        if pos > self.buffer.capacity() {
            return Err(BufferError::Overrun {
                requested: pos,
                remaining: self.buffer.capacity(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.buffer.capacity() - self.pos
    }

    /// Bytes that can still be read.
    pub fn remaining_used(&self) -> usize {
        self.buffer.len().saturating_sub(self.pos)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.buffer.write_at(self.pos, data)?;
        self.pos += data.len();
        Ok(())
    }

    /// Borrow the next `len` bytes and advance past them.
    pub fn read(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let start = self.pos;
        let end = checked_end(start, len, self.buffer.len())?;
        self.pos = end;
        Ok(&self.buffer.as_slice()[start..end])
    }

    /// Fill `dst` from the next bytes and advance.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        self.buffer.read_at(self.pos, dst)?;
        self.pos += dst.len();
        Ok(())
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let mut out = [0u8; N];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Advance past `len` readable bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.read(len).map(|_| ())
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut MessageBuffer {
        &mut self.buffer
    }

    /// Swap in a different buffer, positioned at `offset`, returning the old one.
    pub fn replace_buffer(
        &mut self,
        buffer: MessageBuffer,
        offset: usize,
    ) -> Result<MessageBuffer, BufferError> {
        if offset > buffer.capacity() {
            return Err(BufferError::Overrun {
                requested: offset,
                remaining: buffer.capacity(),
            });
        }
        self.pos = offset;
        Ok(std::mem::replace(&mut self.buffer, buffer))
    }

    /// Detach the buffer, leaving an empty placeholder at offset 0.
    pub fn take_buffer(&mut self) -> MessageBuffer {
        self.pos = 0;
        std::mem::replace(&mut self.buffer, MessageBuffer::wrap(Vec::new()))
    }

    pub fn into_buffer(self) -> MessageBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const CAPACITY: usize = 16;

    fn buffer() -> MessageBuffer {
        MessageBuffer::with_capacity(CAPACITY).unwrap()
    }

    #[rstest]
    #[case(CAPACITY - 1, true)]
    #[case(CAPACITY, true)]
    #[case(CAPACITY + 1, false)]
    fn write_bounded_by_capacity(#[case] len: usize, #[case] fits: bool) {
        let mut cursor = Cursor::new(buffer());
        let result = cursor.write(&vec![0xA5; len]);
        assert_eq!(result.is_ok(), fits);
        if fits {
            assert_eq!(cursor.buffer().len(), len);
        } else {
            assert_eq!(
                result.unwrap_err(),
                BufferError::Overrun {
                    requested: len,
                    remaining: CAPACITY
                }
            );
            assert_eq!(cursor.buffer().len(), 0, "failed write must not truncate");
        }
    }

    #[rstest]
    #[case(CAPACITY - 1, true)]
    #[case(CAPACITY, true)]
    #[case(CAPACITY + 1, false)]
    fn read_bounded_by_used_length(#[case] len: usize, #[case] fits: bool) {
        let mut buf = buffer();
        buf.write_at(0, &[7; CAPACITY]).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read(len).is_ok(), fits);
    }

    #[test]
    fn read_never_passes_declared_length() {
        let mut buf = buffer();
        buf.write_at(0, b"abcd").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read(4).unwrap(), b"abcd");
        assert!(matches!(
            cursor.read(1),
            Err(BufferError::Overrun { requested: 1, remaining: 0 })
        ));
    }

    #[test]
    fn offset_cursor_skips_reserved_bytes() {
        let mut cursor = Cursor::with_offset(buffer(), 8).unwrap();
        cursor.write(b"xy").unwrap();
        assert_eq!(cursor.buffer().len(), 10);
        assert_eq!(&cursor.buffer().as_slice()[8..], b"xy");
        assert_eq!(cursor.remaining(), CAPACITY - 10);
    }

    #[test]
    fn offset_past_capacity_rejected() {
        assert!(Cursor::with_offset(buffer(), CAPACITY + 1).is_err());
    }

    #[test]
    fn set_len_bounded() {
        let mut buf = buffer();
        assert!(buf.set_len(CAPACITY).is_ok());
        assert!(buf.set_len(CAPACITY + 1).is_err());
        assert_eq!(buf.len(), CAPACITY);
    }

    #[test]
    fn wrap_adopts_region() {
        let buf = MessageBuffer::wrap(vec![1, 2, 3]);
        assert!(buf.is_wrapped());
        assert_eq!(buf.capacity(), 3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn copy_and_swap() {
        let mut a = buffer();
        a.write_at(0, b"hello").unwrap();
        let mut b = MessageBuffer::with_capacity(4).unwrap();
        assert!(b.copy_from(&a).is_err());

        let mut c = buffer();
        c.copy_from(&a).unwrap();
        assert_eq!(c.as_slice(), b"hello");

        let mut d = MessageBuffer::wrap(vec![9]);
        c.swap(&mut d);
        assert_eq!(c.as_slice(), &[9]);
        assert_eq!(d.as_slice(), b"hello");
    }

    #[test]
    fn replace_buffer_returns_previous() {
        let mut first = buffer();
        first.write_at(0, b"one").unwrap();
        let mut cursor = Cursor::new(first);
        let old = cursor.replace_buffer(buffer(), 2).unwrap();
        assert_eq!(old.as_slice(), b"one");
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn absurd_allocation_fails_cleanly() {
        let err = MessageBuffer::with_capacity(usize::MAX).unwrap_err();
        assert_eq!(err, BufferError::Allocation { capacity: usize::MAX });
    }
}
