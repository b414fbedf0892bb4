//! Length-prefixed frame codec for the TLS transport.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the payload.
//! The length is validated against [`MAX_FRAME_SIZE`] before any allocation
//! so a hostile peer cannot trigger memory exhaustion with a forged prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::ProtocolError;

/// Hard upper bound on one frame (16 MiB); promise trees and output chunks
/// are far below this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec for [`tokio_util::codec::Framed`] providing frame-based IO over
/// the TLS stream.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello world");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_needs_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn partial_payload_needs_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_prefix_is_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(64 * 1024 * 1024);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Bytes::from_static(b"first")
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Bytes::from_static(b"second")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame_is_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }
}
