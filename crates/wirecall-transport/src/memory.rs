//! In-process channels.
//!
//! [`MemoryTransport::pair`] connects two message-oriented endpoints, useful
//! for loopback testing of clients and servers. [`pipe`] is a raw one-way
//! byte channel that a framing layer can run over, the way it would over a
//! serial line.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::buffer::MessageBuffer;
use crate::error::{Result, TransportError};
use crate::traits::{ByteSink, ByteSource, Transport};

struct Queue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

struct QueueState<T> {
    items: T,
    closed: bool,
}

impl<T: Default> Queue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: T::default(),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Wait until `ready` holds, the queue closes, or the deadline passes.
    ///
    /// Returns the guard and whether `ready` holds.
    fn wait_until<'a>(
        &'a self,
        timeout: Option<Duration>,
        ready: impl Fn(&QueueState<T>) -> bool,
    ) -> (MutexGuard<'a, QueueState<T>>, bool) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock();
        loop {
            if ready(&guard) {
                return (guard, true);
            }
            if guard.closed {
                return (guard, false);
            }
            guard = match deadline {
                None => self
                    .ready
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (guard, false);
                    }
                    self.ready
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// One end of an in-process message channel.
///
/// Messages are delivered whole and in order. Dropping either end closes the
/// channel in both directions; a blocked receive on the other end then fails
/// with [`TransportError::ConnectionClosed`].
pub struct MemoryTransport {
    inbox: Arc<Queue<VecDeque<Vec<u8>>>>,
    outbox: Arc<Queue<VecDeque<Vec<u8>>>>,
    receive_timeout: Option<Duration>,
}

impl MemoryTransport {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let a = Queue::new();
        let b = Queue::new();
        (
            Self {
                inbox: Arc::clone(&a),
                outbox: Arc::clone(&b),
                receive_timeout: None,
            },
            Self {
                inbox: b,
                outbox: a,
                receive_timeout: None,
            },
        )
    }

    /// Fail receives with [`TransportError::Timeout`] after `timeout`.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Close both directions without dropping this end.
    pub fn close(&self) {
        self.inbox.close();
        self.outbox.close();
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &mut MessageBuffer) -> Result<()> {
        let mut state = self.outbox.lock();
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        state.items.push_back(message.as_slice().to_vec());
        drop(state);
        self.outbox.ready.notify_one();
        trace!(len = message.len(), "memory transport send");
        Ok(())
    }

    fn receive(&self, message: &mut MessageBuffer) -> Result<()> {
        let (mut state, ready) = self
            .inbox
            .wait_until(self.receive_timeout, |s| !s.items.is_empty());
        if !ready {
            return Err(if state.closed {
                TransportError::ConnectionClosed
            } else {
                TransportError::Timeout
            });
        }
        let Some(bytes) = state.items.pop_front() else {
            return Err(TransportError::ConnectionClosed);
        };
        drop(state);

        if bytes.len() > message.capacity() {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                max: message.capacity(),
            });
        }
        message.reset();
        message.write_at(0, &bytes)?;
        trace!(len = bytes.len(), "memory transport receive");
        Ok(())
    }

    fn has_message(&self) -> bool {
        let state = self.inbox.lock();
        !state.items.is_empty() || state.closed
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("pending", &self.inbox.lock().items.len())
            .field("receive_timeout", &self.receive_timeout)
            .finish()
    }
}

/// Reading end of an in-process byte pipe.
pub struct PipeReader {
    queue: Arc<Queue<BytesMut>>,
    read_timeout: Option<Duration>,
}

/// Writing end of an in-process byte pipe.
pub struct PipeWriter {
    queue: Arc<Queue<BytesMut>>,
}

/// A unidirectional byte pipe. Bytes written to the writer are read, in
/// order and without boundaries, from the reader.
///
/// Dropping either end closes the pipe. Two pipes make a duplex channel.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let queue = Queue::new();
    (
        PipeWriter {
            queue: Arc::clone(&queue),
        },
        PipeReader {
            queue,
            read_timeout: None,
        },
    )
}

impl PipeReader {
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Bytes written and not yet consumed.
    pub fn pending(&self) -> usize {
        self.queue.lock().items.len()
    }
}

impl ByteSource for PipeReader {
    fn underlying_receive(&mut self, data: &mut [u8]) -> Result<()> {
        let want = data.len();
        let (mut state, ready) = self
            .queue
            .wait_until(self.read_timeout, |s| s.items.len() >= want);
        if !ready {
            return Err(if state.closed {
                TransportError::ConnectionClosed
            } else {
                TransportError::Timeout
            });
        }
        state.items.copy_to_slice(data);
        trace!(len = want, "pipe receive");
        Ok(())
    }

    fn has_data(&mut self) -> Result<bool> {
        let state = self.queue.lock();
        Ok(!state.items.is_empty() || state.closed)
    }
}

impl ByteSink for PipeWriter {
    fn underlying_send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.queue.lock();
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        state.items.extend_from_slice(data);
        drop(state);
        self.queue.ready.notify_all();
        trace!(len = data.len(), "pipe send");
        Ok(())
    }
}

impl PipeWriter {
    /// Close the pipe; the reader fails once buffered bytes run out.
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("pending", &self.pending())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}
