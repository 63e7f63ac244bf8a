//! Length-delimited stream framing.
//!
//! Every frame on the TCP stream is `u32 LE length || frame bytes`. The
//! decoder yields the raw frame bytes without interpreting them — command
//! dispatch happens in the channel, so a semantically bad frame never
//! kills the codec or the stream position.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ChannelError;

/// Hard cap on a single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Default)]
pub struct ChannelCodec;

impl Decoder for ChannelCodec {
    type Item = Bytes;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ChannelError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[0..4].try_into().expect("4 bytes checked")) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for ChannelCodec {
    type Error = ChannelError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ChannelError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = ChannelCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x03hello"), &mut buf)
            .unwrap();
        codec
            .encode(Bytes::from_static(b"\x02"), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"\x03hello");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], b"\x02");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = ChannelCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x03some payload"), &mut full)
            .unwrap();

        // Feed one byte at a time; nothing decodes until the last byte.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(&result.unwrap()[..], b"\x03some payload");
            }
        }
    }

    #[test]
    fn zero_length_frame_decodes_to_empty() {
        // The codec passes it through; the channel rejects it as a
        // zero-length frame.
        let mut codec = ChannelCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn oversize_declared_length_rejected() {
        let mut codec = ChannelCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_SIZE + 1) as u32);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { .. }));
    }
}
