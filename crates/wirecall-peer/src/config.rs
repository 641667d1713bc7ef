use std::time::Duration;

/// Default number of concurrently pending arbitrated calls.
pub const DEFAULT_MAX_PENDING_CLIENTS: usize = 16;

/// Configuration for a [`TransportArbitrator`](crate::TransportArbitrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitratorConfig {
    /// Fixed number of pending-client slots, allocated up front.
    pub max_pending_clients: usize,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            max_pending_clients: DEFAULT_MAX_PENDING_CLIENTS,
        }
    }
}

/// Configuration for a [`ClientManager`](crate::ClientManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long an arbitrated call waits for its reply. `None` waits forever.
    pub reply_timeout: Option<Duration>,
    /// Reject two-way calls that would wait on the thread that must receive
    /// their reply.
    pub nested_call_detection: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            nested_call_detection: true,
        }
    }
}

/// Configuration for a [`SimpleServer`](crate::SimpleServer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Leave `run` on the first undecodable or unroutable message instead of
    /// logging it and continuing.
    pub stop_on_protocol_error: bool,
}
