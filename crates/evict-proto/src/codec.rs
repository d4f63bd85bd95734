//! Framed codec for stream transports.
//!
//! [`FrameCodec`] carries the receiver's own identity so every decoded
//! [`Frame`] already knows whether it was sent by this node. It also exposes
//! the plain `encode`/`decode_header` pair used by datagram transports and by
//! the relay handshake, which reads a bare header.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, FrameResult};
use crate::frame::{encode_frame, put_header, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::identity::LocalIdentity;
use crate::opcode::OpCode;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header as seen by the decoding receiver.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Operation code of the frame.
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// True when the frame was written by the decoding receiver itself.
    #[must_use]
    pub const fn sent_by_me(&self) -> bool {
        self.header.sent_by_me
    }
}

/// Frame encoder/decoder bound to one local identity.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    local: LocalIdentity,
    max_payload: usize,
}

impl FrameCodec {
    /// Creates a codec for `local` accepting payloads up to the 24-bit limit.
    #[must_use]
    pub const fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            max_payload: MAX_PAYLOAD_LEN,
        }
    }

    /// Caps accepted and produced payloads at `max_payload` bytes.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(MAX_PAYLOAD_LEN);
        self
    }

    /// The identity frames are stamped with.
    #[must_use]
    pub const fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    /// Largest payload this codec accepts.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Prepends the header to `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds the limit.
    pub fn encode(&self, payload: &[u8], opcode: OpCode) -> FrameResult<Bytes> {
        self.check_len(payload.len())?;
        encode_frame(&self.local, opcode, payload)
    }

    /// Decodes a header and derives `sent_by_me` against this codec's identity.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if fewer than 20 bytes are supplied.
    pub fn decode_header(&self, buf: &[u8]) -> FrameResult<FrameHeader> {
        FrameHeader::decode(buf, &self.local)
    }

    /// Decodes a complete datagram: header plus exactly the declared payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] for runt datagrams,
    /// [`FrameError::LengthMismatch`] when the payload size disagrees with the
    /// header, and [`FrameError::PayloadTooLarge`] above the limit.
    pub fn decode_datagram(&self, datagram: &[u8]) -> FrameResult<Frame> {
        let header = self.decode_header(datagram)?;
        self.check_len(header.payload_len)?;
        let actual = datagram.len() - HEADER_LEN;
        if actual != header.payload_len {
            return Err(FrameError::LengthMismatch {
                declared: header.payload_len,
                actual,
            });
        }
        Ok(Frame {
            header,
            payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
        })
    }

    const fn check_len(&self, len: usize) -> FrameResult<()> {
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                limit: self.max_payload,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = self.decode_header(src)?;
        self.check_len(header.payload_len)?;

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.payload_len).freeze();
        Ok(Some(Frame { header, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let needed = self
            .decode_header(src)
            .map_or(HEADER_LEN, |header| header.frame_len());
        Err(FrameError::Truncated {
            needed,
            got: src.len(),
        })
    }
}

impl Encoder<(OpCode, Bytes)> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: (OpCode, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (opcode, payload) = item;
        self.check_len(payload.len())?;
        put_header(dst, &self.local, opcode, payload.len())?;
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn payload(n: u8) -> Vec<u8> {
        (0..n).collect()
    }

    #[test]
    fn test_encode_then_decode_header() {
        let codec = FrameCodec::new(LocalIdentity::generate());
        let frame = codec.encode(&payload(10), OpCode::Evict).unwrap();
        let header = codec.decode_header(&frame).unwrap();

        assert_eq!(header.opcode, OpCode::Evict);
        assert_eq!(header.payload_len, 10);
        assert!(header.sent_by_me);
    }

    #[test]
    fn test_encode_respects_max_payload() {
        let codec = FrameCodec::new(LocalIdentity::generate()).with_max_payload(8);
        let err = codec.encode(&payload(9), OpCode::Evict).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { len: 9, limit: 8 }));
    }

    #[test]
    fn test_decode_datagram_length_mismatch() {
        let sender = FrameCodec::new(LocalIdentity::generate());
        let receiver = FrameCodec::new(LocalIdentity::generate());
        let frame = sender.encode(&payload(10), OpCode::Evict).unwrap();

        let err = receiver.decode_datagram(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthMismatch {
                declared: 10,
                actual: 9
            }
        ));
    }

    #[test]
    fn test_decode_datagram_runt() {
        let receiver = FrameCodec::new(LocalIdentity::generate());
        let err = receiver.decode_datagram(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let sender = FrameCodec::new(LocalIdentity::generate());
        let mut receiver = FrameCodec::new(LocalIdentity::generate());
        let frame = sender.encode(&payload(10), OpCode::Evict).unwrap();

        let mut buf = BytesMut::from(&frame[..HEADER_LEN + 4]);
        assert!(receiver.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[HEADER_LEN + 4..]);
        let decoded = receiver.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), payload(10).as_slice());
        assert!(!decoded.sent_by_me());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversized_declared_length() {
        let sender = FrameCodec::new(LocalIdentity::generate());
        let mut receiver = FrameCodec::new(LocalIdentity::generate()).with_max_payload(4);
        let frame = sender.encode(&payload(10), OpCode::Evict).unwrap();

        let mut buf = BytesMut::from(&frame[..HEADER_LEN]);
        assert!(matches!(
            receiver.decode(&mut buf),
            Err(FrameError::PayloadTooLarge { len: 10, limit: 4 })
        ));
    }

    #[test]
    fn test_decode_eof_reports_truncation() {
        let sender = FrameCodec::new(LocalIdentity::generate());
        let mut receiver = FrameCodec::new(LocalIdentity::generate());
        let frame = sender.encode(&payload(10), OpCode::Evict).unwrap();

        let mut buf = BytesMut::from(&frame[..HEADER_LEN + 3]);
        let err = receiver.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                needed: 30,
                got: 23
            }
        ));
    }

    #[test]
    fn test_decode_eof_on_clean_boundary() {
        let mut receiver = FrameCodec::new(LocalIdentity::generate());
        let mut buf = BytesMut::new();
        assert!(receiver.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_stream_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let writer_id = LocalIdentity::generate();

        let mut writer = FramedWrite::new(client, FrameCodec::new(writer_id));
        let mut reader = FramedRead::new(server, FrameCodec::new(LocalIdentity::generate()));

        writer
            .send((OpCode::Hello, Bytes::from_static(b"node-1")))
            .await
            .unwrap();
        writer
            .send((OpCode::Evict, Bytes::from(payload(10))))
            .await
            .unwrap();
        drop(writer);

        let hello = reader.next().await.unwrap().unwrap();
        assert_eq!(hello.opcode(), OpCode::Hello);
        assert_eq!(hello.payload.as_ref(), b"node-1");
        assert_eq!(hello.header.sender, writer_id);

        let evict = reader.next().await.unwrap().unwrap();
        assert_eq!(evict.opcode(), OpCode::Evict);
        assert_eq!(evict.payload.len(), 10);

        assert!(reader.next().await.is_none());
    }
}
