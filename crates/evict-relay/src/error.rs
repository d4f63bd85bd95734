//! Error types for the relay server.

use std::net::SocketAddr;

use evict_proto::FrameError;
use thiserror::Error;

/// Errors that stop the relay server as a whole.
///
/// Per-peer failures never surface here; they end in a [`Disconnect`]
/// for that peer only.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Frame construction failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error on the listening socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Why a peer was dropped from the relay.
#[derive(Debug, Error)]
pub enum Disconnect {
    /// The peer closed its side of the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Reading from or writing to the peer socket failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The header announced more payload than the relay accepts.
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    Oversized {
        /// Announced payload length.
        len: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The connection ended part way through a payload.
    #[error("connection closed inside a {len} byte payload")]
    Truncated {
        /// Announced payload length.
        len: usize,
    },

    /// The header could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    /// The payload did not follow its header in time.
    #[error("payload of {len} bytes not received within {timeout_ms}ms")]
    PayloadTimeout {
        /// Announced payload length.
        len: usize,
        /// Read deadline that expired.
        timeout_ms: u64,
    },

    /// The peer's outbound queue was full.
    #[error("outbound queue full")]
    SlowConsumer,

    /// The peer's writer task is gone.
    #[error("outbound queue closed")]
    QueueClosed,

    /// The relay is shutting down.
    #[error("relay shutting down")]
    Shutdown,
}
