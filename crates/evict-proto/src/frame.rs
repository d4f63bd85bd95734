//! Fixed 20-byte frame header.
//!
//! Layout: sender identity (16 bytes) followed by one little-endian `u32`
//! holding `(payload_len << 8) | opcode`. The payload follows immediately.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, FrameResult};
use crate::identity::{LocalIdentity, IDENTITY_LEN};
use crate::opcode::OpCode;

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = IDENTITY_LEN + 4;

/// Largest payload the 24-bit length field can carry.
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

/// A decoded frame header, as seen by one particular receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Identity of the transport that wrote the frame.
    pub sender: LocalIdentity,
    /// Operation code.
    pub opcode: OpCode,
    /// Number of payload bytes following the header.
    pub payload_len: usize,
    /// True when `sender` equals the decoding receiver's own identity.
    pub sent_by_me: bool,
}

impl FrameHeader {
    /// Decodes a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// `sent_by_me` is derived against `local`; it is never read from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if `buf` is shorter than a header.
    pub fn decode(buf: &[u8], local: &LocalIdentity) -> FrameResult<Self> {
        let (Some(sender), Some(packed)) = (
            LocalIdentity::from_prefix(buf),
            buf.get(IDENTITY_LEN..HEADER_LEN),
        ) else {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        };

        let mut field = [0u8; 4];
        field.copy_from_slice(packed);
        let packed = u32::from_le_bytes(field);

        Ok(Self {
            sender,
            opcode: OpCode::from_wire((packed & 0xff) as u8),
            payload_len: (packed >> 8) as usize,
            sent_by_me: sender == *local,
        })
    }

    /// Total frame length (header plus payload).
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

/// Packs the length and opcode into the 4-byte header field.
fn packed_field(opcode: OpCode, payload_len: usize) -> u32 {
    ((payload_len as u32) << 8) | u32::from(opcode.to_wire())
}

/// Writes a header for a payload of `payload_len` bytes into `dst`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the length does not fit 24 bits
/// and [`FrameError::InvalidOpCode`] for an `Other` code that would decode as
/// a different opcode.
pub fn put_header(
    dst: &mut BytesMut,
    sender: &LocalIdentity,
    opcode: OpCode,
    payload_len: usize,
) -> FrameResult<()> {
    if let OpCode::Other(raw) = opcode {
        if !opcode.is_encodable() {
            return Err(FrameError::InvalidOpCode(raw));
        }
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            limit: MAX_PAYLOAD_LEN,
        });
    }
    dst.reserve(HEADER_LEN);
    dst.put_slice(sender.as_bytes());
    dst.put_u32_le(packed_field(opcode, payload_len));
    Ok(())
}

/// Encodes one complete frame (header and payload) into a single buffer.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload does not fit 24 bits.
pub fn encode_frame(sender: &LocalIdentity, opcode: OpCode, payload: &[u8]) -> FrameResult<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_header(&mut buf, sender, opcode, payload.len())?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}
