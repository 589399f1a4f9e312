//! The `tokio_util::codec` framing layer: strips/applies the 4-byte length
//! prefix so a [`Framed`](tokio_util::codec::Framed) stream yields whole
//! message bodies (code + payload) rather than raw bytes.
//!
//! This is the direct analogue of cratetorrent's `peer::codec` module,
//! which swaps a `HandshakeCodec` for a `PeerCodec` on the same
//! `FramedParts`; here a single codec suffices since every domain shares
//! the same length-prefixed envelope and only the code width differs,
//! which domain decoding (`wire::server`/`peer`/`distributed`) handles on
//! the already-stripped body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{check_message_len, Error, LENGTH_PREFIX_LEN};

#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        check_message_len(len)?;
        let total = LENGTH_PREFIX_LEN + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len as usize)))
    }
}

/// Outbound frames are already fully framed (length prefix included) by the
/// `wire::{server,peer,distributed,init}::frame` helpers, so encoding is a
/// straight copy.
impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[3]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_oversize_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(super::super::MAX_MESSAGE_LEN + 1).to_le_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(Error::Oversize { .. })));
    }

    #[test]
    fn encode_writes_bytes_through_unchanged() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(&[9, 9, 9]), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[9, 9, 9]);
    }
}
