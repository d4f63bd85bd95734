//! Relay server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Port the relay listens on when none is given.
pub const DEFAULT_PORT: u16 = 9999;

/// Largest eviction payload the relay forwards.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_000;

/// Frames buffered per peer before it is treated as a slow consumer.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Termination signals needed to stop the relay.
pub const DEFAULT_SIGNAL_COUNT: u32 = 5;

/// Configuration for the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to accept peers on.
    pub bind_addr: SocketAddr,
    /// Frames announcing a longer payload disconnect the sender.
    pub max_message_size: usize,
    /// Deadline for a payload to arrive after its header.
    pub payload_timeout: Duration,
    /// Capacity of each peer's outbound queue.
    pub outbound_queue_depth: usize,
    /// Number of termination signals before the process exits.
    pub signal_count: u32,
}

impl RelayConfig {
    /// Create a configuration listening on `bind_addr`.
    #[must_use]
    pub const fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            payload_timeout: Duration::from_secs(5),
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            signal_count: DEFAULT_SIGNAL_COUNT,
        }
    }

    /// Listen on all interfaces at `port`.
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the payload read timeout.
    #[must_use]
    pub const fn with_payload_timeout(mut self, timeout: Duration) -> Self {
        self.payload_timeout = timeout;
        self
    }

    /// Set the per-peer outbound queue depth. Zero is raised to one.
    #[must_use]
    pub const fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = if depth == 0 { 1 } else { depth };
        self
    }

    /// Set how many termination signals stop the relay.
    #[must_use]
    pub const fn with_signal_count(mut self, count: u32) -> Self {
        self.signal_count = count;
        self
    }

    /// Check if a payload length is within the allowed limit.
    #[must_use]
    pub const fn is_message_size_valid(&self, size: usize) -> bool {
        size <= self.max_message_size
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::with_port(DEFAULT_PORT)
    }
}
