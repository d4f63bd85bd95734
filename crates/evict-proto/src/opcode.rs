//! Operation codes carried in the low byte of the packed header field.

use std::fmt;

/// The operation of a frame.
///
/// Only the low seven bits are transmitted. Bit 7 is reserved for the
/// receiver-side `SentByMe` marker and is stripped on both encode and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Client greeting; payload is the client's display name.
    Hello,
    /// Relay acknowledgement of a `Hello`; always zero-length.
    Welcome,
    /// Cache eviction payload.
    Evict,
    /// Any other value. Relayed peers log it and move on.
    Other(u8),
}

impl OpCode {
    /// Receiver-derived marker bit. Never put on the wire.
    pub const SENT_BY_ME: u8 = 0x80;

    const HELLO: u8 = 1;
    const WELCOME: u8 = 2;
    const EVICT: u8 = 4;

    /// Decodes the low byte of the packed header field.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Self {
        match byte & !Self::SENT_BY_ME {
            Self::HELLO => Self::Hello,
            Self::WELCOME => Self::Welcome,
            Self::EVICT => Self::Evict,
            other => Self::Other(other),
        }
    }

    /// Returns the byte written into the header, with `SentByMe` cleared.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        let raw = match self {
            Self::Hello => Self::HELLO,
            Self::Welcome => Self::WELCOME,
            Self::Evict => Self::EVICT,
            Self::Other(b) => b,
        };
        raw & !Self::SENT_BY_ME
    }

    /// Whether the opcode decodes back to itself after encoding.
    ///
    /// False for `Other` values with bit 7 set or that name a known code.
    #[must_use]
    pub fn is_encodable(self) -> bool {
        Self::from_wire(self.to_wire()) == self
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => f.write_str("Hello"),
            Self::Welcome => f.write_str("Welcome"),
            Self::Evict => f.write_str("Evict"),
            Self::Other(b) => write!(f, "Op({b:#04x})"),
        }
    }
}
