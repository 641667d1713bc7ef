//! Calling and serving over wirecall transports.
//!
//! - [`ClientManager`] builds requests, sends them, and matches replies.
//! - [`SimpleServer`] dispatches incoming calls to registered [`Service`]s.
//! - [`TransportArbitrator`] lets one transport carry calls in both
//!   directions: a server loop or [`ReceivePump`] owns the receive side and
//!   hands each reply to the caller waiting on its sequence number.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wirecall_codec::BasicCodecFactory;
//! use wirecall_peer::ClientManager;
//! use wirecall_transport::{DynamicBufferFactory, MemoryTransport};
//!
//! let (local, _remote) = MemoryTransport::pair();
//! let client = ClientManager::new(
//!     Arc::new(local),
//!     Arc::new(BasicCodecFactory),
//!     Arc::new(DynamicBufferFactory::default()),
//! );
//! let mut reply = client.call(1, 1, |args| args.write_string("ping"))?;
//! let _text = reply.codec().read_string()?;
//! # Ok::<(), wirecall_peer::RpcError>(())
//! ```

pub mod arbitrator;
pub mod client;
pub mod config;
pub mod error;
pub mod pump;
pub mod server;
pub mod service;

pub use arbitrator::{PendingClient, TransportArbitrator};
pub use client::{CallFailure, ClientManager, ErrorHandler, RequestContext};
pub use config::{ArbitratorConfig, ClientConfig, ServerConfig, DEFAULT_MAX_PENDING_CLIENTS};
pub use error::{ErrorKind, Result, RpcError};
pub use pump::ReceivePump;
pub use server::{Server, SimpleServer, StopHandle};
pub use service::{Invocation, Service};
