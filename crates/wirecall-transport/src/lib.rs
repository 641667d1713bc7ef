//! Transport layer for wirecall.
//!
//! This is the lowest layer of the stack. It defines:
//! - [`MessageBuffer`] and [`Cursor`], the bounded byte regions every other
//!   layer reads and writes
//! - [`MessageBufferFactory`] implementations that hand buffers out
//! - the [`Transport`] capability (whole messages) and the [`ByteSource`] /
//!   [`ByteSink`] capability (raw bytes) that framing builds on
//! - concrete channels: Unix domain sockets, TCP and in-process pairs
//! - the [`Status`] table shared by all layers

pub mod buffer;
pub mod error;
pub mod factory;
pub mod memory;
pub mod status;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
mod sys;
#[cfg(unix)]
pub mod uds;

pub use buffer::{Cursor, MessageBuffer};
pub use error::{BufferError, FramePart, Result, TransportError};
pub use factory::{
    DynamicBufferFactory, MessageBufferFactory, PooledBufferFactory, DEFAULT_BUFFER_CAPACITY,
};
pub use memory::{pipe, MemoryTransport, PipeReader, PipeWriter};
pub use status::Status;
pub use tcp::TcpEndpoint;
pub use traits::{ByteSink, ByteSource, IoChannel, IpcStream, Transport};

#[cfg(unix)]
pub use uds::UdsListener;
