//! Message buffer factories.
//!
//! Client managers and servers obtain every buffer from a factory and return
//! it on every exit path. Two strategies are provided: plain heap allocation
//! per message, and a fixed pool allocated up front for hosts that must not
//! allocate on the call path.

use std::sync::Mutex;

use tracing::trace;

use crate::buffer::MessageBuffer;
use crate::error::BufferError;

/// Default buffer capacity in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Source and sink of message buffers.
pub trait MessageBufferFactory: Send + Sync {
    /// Obtain an empty buffer.
    fn create(&self) -> Result<MessageBuffer, BufferError>;

    /// Return a buffer obtained from [`create`](Self::create).
    fn dispose(&self, buffer: MessageBuffer);

    /// Whether a server must obtain a fresh buffer before each receive.
    ///
    /// Zero-copy transports that hand out their own regions return `false`.
    fn create_server_buffer(&self) -> bool {
        true
    }

    /// Capacity of buffers produced by this factory.
    fn buffer_capacity(&self) -> usize;
}

/// Allocates a new buffer for every message.
#[derive(Debug, Clone)]
pub struct DynamicBufferFactory {
    capacity: usize,
}

impl DynamicBufferFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for DynamicBufferFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl MessageBufferFactory for DynamicBufferFactory {
    fn create(&self) -> Result<MessageBuffer, BufferError> {
        MessageBuffer::with_capacity(self.capacity)
    }

    fn dispose(&self, _buffer: MessageBuffer) {}

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }
}

/// Fixed pool of preallocated buffers.
///
/// `create` fails with [`BufferError::Allocation`] once every buffer is
/// checked out. Wrapped buffers and buffers of a foreign capacity are dropped
/// on dispose rather than pooled, so the pool never exceeds its initial size.
#[derive(Debug)]
pub struct PooledBufferFactory {
    capacity: usize,
    slots: usize,
    pool: Mutex<Vec<MessageBuffer>>,
}

impl PooledBufferFactory {
    /// Preallocate `slots` buffers of `capacity` bytes each.
    pub fn new(slots: usize, capacity: usize) -> Result<Self, BufferError> {
        let mut pool = Vec::with_capacity(slots);
        for _ in 0..slots {
            pool.push(MessageBuffer::with_capacity(capacity)?);
        }
        Ok(Self {
            capacity,
            slots,
            pool: Mutex::new(pool),
        })
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Total pool size.
    pub fn slots(&self) -> usize {
        self.slots
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MessageBuffer>> {
        self.pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MessageBufferFactory for PooledBufferFactory {
    fn create(&self) -> Result<MessageBuffer, BufferError> {
        let buffer = self.lock().pop().ok_or(BufferError::Allocation {
            capacity: self.capacity,
        })?;
        trace!(capacity = self.capacity, "buffer checked out of pool");
        Ok(buffer)
    }

    fn dispose(&self, mut buffer: MessageBuffer) {
        if buffer.is_wrapped() || buffer.capacity() != self.capacity {
            return;
        }
        let mut pool = self.lock();
        if pool.len() < self.slots {
            buffer.reset();
            pool.push(buffer);
        }
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }
}
