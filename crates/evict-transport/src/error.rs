//! Error types for evict-transport.

use evict_proto::{AddressError, FrameError};
use thiserror::Error;

/// Errors raised by cluster transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Missing or malformed configuration. Fatal at `init`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The message broker could not be reached.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The channel is unusable; the transport instance should be discarded.
    #[error("communication broken: {0}")]
    CommunicationBroken(String),

    /// The relay rejected or garbled the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,

    /// `send` was called before a successful `init`.
    #[error("transport is not initialized")]
    NotInitialized,

    /// The payload exceeds the transport's maximum message size.
    #[error("payload of {len} bytes exceeds maximum message size of {limit} bytes")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Maximum message size.
        limit: usize,
    },

    /// Frame codec failure.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AddressError> for TransportError {
    fn from(err: AddressError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::PayloadTooLarge { len, limit } => Self::PayloadTooLarge { len, limit },
            FrameError::Io(io) => Self::Io(io),
            other => Self::Frame(other),
        }
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self::BrokerUnreachable(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
