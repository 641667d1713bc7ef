//! Transport-agnostic RPC runtime.
//!
//! wirecall moves typed calls between peers over any channel that can carry
//! bytes: Unix sockets, TCP, serial-style byte streams, or in-process queues.
//!
//! # Crate Structure
//!
//! - [`transport`]: message buffers, status codes, the `Transport` trait and
//!   physical channels
//! - [`frame`]: CRC-16 protected framing for raw byte channels
//! - [`codec`]: message headers and typed value encoding
//! - [`peer`]: clients, servers and reply arbitration (behind `peer` feature)
//! - [`endpoint`]: socket addresses accepted by the CLI and examples
//! - [`echo`]: demo service and typed client (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use wirecall_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use wirecall_frame::*;
}

/// Re-export codec types.
pub mod codec {
    pub use wirecall_codec::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use wirecall_peer::*;
}

#[cfg(feature = "peer")]
pub mod echo;
pub mod endpoint;

pub use endpoint::{Endpoint, EndpointListener, EndpointParseError};
