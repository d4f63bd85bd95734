//! Error types for evict-proto.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Fewer bytes than a full header (or declared payload) were available.
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// The declared payload length disagrees with the bytes received.
    #[error("length mismatch: header declares {declared} bytes, received {actual}")]
    LengthMismatch {
        /// Length announced by the header.
        declared: usize,
        /// Length actually received.
        actual: usize,
    },

    /// The payload does not fit the 24-bit length field or the configured limit.
    #[error("payload of {len} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Effective limit.
        limit: usize,
    },

    /// An `Other` opcode that would decode as something else.
    #[error("opcode {0:#04x} cannot be encoded")]
    InvalidOpCode(u8),

    /// IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors raised while parsing an endpoint address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The address string was empty.
    #[error("address is empty")]
    Empty,

    /// No `:port` suffix was found.
    #[error("address '{0}' has no port")]
    MissingPort(String),

    /// The port was not a valid non-zero `u16`.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// The host part was empty.
    #[error("address '{0}' has no host")]
    MissingHost(String),
}
