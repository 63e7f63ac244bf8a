//! Wire frames and the multi-post `Messages` payload.
//!
//! ## Wire format
//!
//! **Frame**:
//! ```text
//! command:  u8   (1)
//! payload:  [u8] (command-specific)
//! ```
//!
//! **`Messages` payload**:
//! ```text
//! chat_id:  u64 LE (8)
//! posts:    Post+
//! ```
//!
//! **Post** (the first bytes of `data` are `{version, 4-byte unix
//! timestamp, data-type}` to the layer above; opaque here):
//! ```text
//! length:   i32 LE (4)
//! data:     [u8; length]
//! ```
//!
//! **`DataReceivedConfirmation` payload**: `data_id: u32 LE (4)`.
//!
//! **`ConnectionEstablished` payload** (login):
//! `my_id: u64 LE (8) || domain: u32 LE (4)`.
//!
//! Every frame must round-trip byte-for-byte: the router and several
//! heterogeneous client implementations share this format.

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::Command;
use crate::error::ChannelError;

/// Identifier correlating a frame with its eventual delivery confirmation.
///
/// Derived from content — the first 4 bytes (LE) of the blake3 hash — so
/// both ends of the wire can compute it from the bytes alone.
pub fn data_id(frame_bytes: &[u8]) -> u32 {
    let hash = blake3::hash(frame_bytes);
    u32::from_le_bytes(
        hash.as_bytes()[0..4]
            .try_into()
            .expect("blake3 output is 32 bytes"),
    )
}

/// One decoded wire frame: a command byte plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    /// Keep-alive frame.
    pub fn ping() -> Self {
        Self {
            command: Command::Ping,
            payload: Bytes::new(),
        }
    }

    /// Session login frame sent right after the socket opens.
    pub fn login(my_id: u64, domain: u32) -> Self {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64_le(my_id);
        buf.put_u32_le(domain);
        Self {
            command: Command::ConnectionEstablished,
            payload: buf.freeze(),
        }
    }

    /// Acknowledgment of a received frame.
    pub fn data_received_confirmation(data_id: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(data_id);
        Self {
            command: Command::DataReceivedConfirmation,
            payload: buf.freeze(),
        }
    }

    /// Bundle `posts` for `chat_id` into a `Messages` frame.
    pub fn messages(chat_id: u64, posts: &[Bytes]) -> Self {
        let body: usize = posts.iter().map(|p| 4 + p.len()).sum();
        let mut buf = BytesMut::with_capacity(8 + body);
        buf.put_u64_le(chat_id);
        for post in posts {
            buf.put_i32_le(post.len() as i32);
            buf.extend_from_slice(post);
        }
        Self {
            command: Command::Messages,
            payload: buf.freeze(),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to the exact wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire bytes back into a frame.
    pub fn decode(raw: &[u8]) -> Result<Self, ChannelError> {
        if raw.is_empty() {
            return Err(ChannelError::MalformedFrame("zero-length frame"));
        }
        let command = Command::try_from(raw[0])?;
        Ok(Self {
            command,
            payload: Bytes::copy_from_slice(&raw[1..]),
        })
    }

    /// The acknowledged data id carried by a confirmation frame.
    pub fn confirmation_data_id(&self) -> Result<u32, ChannelError> {
        if self.command != Command::DataReceivedConfirmation {
            return Err(ChannelError::MalformedFrame("not a confirmation frame"));
        }
        if self.payload.len() != 4 {
            return Err(ChannelError::MalformedFrame(
                "confirmation payload must be 4 bytes",
            ));
        }
        Ok(u32::from_le_bytes(
            self.payload[0..4].try_into().expect("4 bytes checked"),
        ))
    }

    /// Decode a `Messages` payload into `(chat_id, posts)`.
    ///
    /// All-or-nothing: any length violation (negative length, declared
    /// length past the end, trailing bytes) rejects the entire frame —
    /// partial acceptance of a malformed multi-post frame is not
    /// permitted.
    pub fn split_posts(&self) -> Result<(u64, Vec<Bytes>), ChannelError> {
        if self.command != Command::Messages {
            return Err(ChannelError::MalformedFrame("not a Messages frame"));
        }
        if self.payload.len() < 8 {
            return Err(ChannelError::MalformedFrame(
                "Messages payload shorter than chat id",
            ));
        }
        let chat_id = u64::from_le_bytes(
            self.payload[0..8].try_into().expect("8 bytes checked"),
        );

        let mut posts = Vec::new();
        let mut p = 8usize;
        while p < self.payload.len() {
            if p + 4 > self.payload.len() {
                return Err(ChannelError::MalformedFrame("truncated post length"));
            }
            let len = i32::from_le_bytes(
                self.payload[p..p + 4].try_into().expect("4 bytes checked"),
            );
            p += 4;
            if len < 0 {
                return Err(ChannelError::MalformedFrame("negative post length"));
            }
            let len = len as usize;
            if p + len > self.payload.len() {
                return Err(ChannelError::MalformedFrame(
                    "post length exceeds payload",
                ));
            }
            posts.push(self.payload.slice(p..p + len));
            p += len;
        }
        // The loop exits exactly at the payload end or errored above.
        Ok((chat_id, posts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_byte_for_byte() {
        let posts = [
            Bytes::from_static(b"hello"),
            Bytes::from_static(b""),
            Bytes::from_static(b"a longer third post with some content"),
        ];
        let frame = Frame::messages(0xDEAD_BEEF_CAFE_0042, &posts);

        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);

        let (chat_id, out) = decoded.split_posts().unwrap();
        assert_eq!(chat_id, 0xDEAD_BEEF_CAFE_0042);
        assert_eq!(out.len(), 3);
        for (expected, actual) in posts.iter().zip(&out) {
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn messages_with_no_posts() {
        let frame = Frame::messages(7, &[]);
        let (chat_id, posts) = frame.split_posts().unwrap();
        assert_eq!(chat_id, 7);
        assert!(posts.is_empty());
    }

    #[test]
    fn declared_length_past_end_rejects_whole_frame() {
        // Well-formed first post, then a post claiming 100 bytes with 5 left.
        let mut payload = BytesMut::new();
        payload.put_u64_le(1);
        payload.put_i32_le(2);
        payload.extend_from_slice(b"ok");
        payload.put_i32_le(100);
        payload.extend_from_slice(b"short");
        let frame = Frame::new(Command::Messages, payload.freeze());

        let err = frame.split_posts().unwrap_err();
        assert!(matches!(err, ChannelError::MalformedFrame(_)));
    }

    #[test]
    fn trailing_bytes_reject_whole_frame() {
        let mut payload = BytesMut::new();
        payload.put_u64_le(1);
        payload.put_i32_le(2);
        payload.extend_from_slice(b"ok");
        payload.extend_from_slice(b"xyz"); // not enough for another length
        let frame = Frame::new(Command::Messages, payload.freeze());

        assert!(frame.split_posts().is_err());
    }

    #[test]
    fn negative_post_length_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u64_le(1);
        payload.put_i32_le(-4);
        let frame = Frame::new(Command::Messages, payload.freeze());

        let err = frame.split_posts().unwrap_err();
        assert!(matches!(err, ChannelError::MalformedFrame(_)));
    }

    #[test]
    fn payload_shorter_than_chat_id_rejected() {
        let frame = Frame::new(Command::Messages, Bytes::from_static(b"1234"));
        assert!(frame.split_posts().is_err());
    }

    #[test]
    fn decode_empty_is_malformed() {
        let err = Frame::decode(&[]).unwrap_err();
        assert!(matches!(err, ChannelError::MalformedFrame(_)));
    }

    #[test]
    fn decode_unknown_command_is_unsupported() {
        let err = Frame::decode(&[0x7F, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedCommand(0x7F)));
    }

    #[test]
    fn confirmation_roundtrip() {
        let frame = Frame::data_received_confirmation(0xAABB_CCDD);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.confirmation_data_id().unwrap(), 0xAABB_CCDD);
    }

    #[test]
    fn confirmation_wrong_payload_size() {
        let frame = Frame::new(
            Command::DataReceivedConfirmation,
            Bytes::from_static(b"abc"),
        );
        assert!(frame.confirmation_data_id().is_err());
    }

    #[test]
    fn login_layout() {
        let frame = Frame::login(0x0102_0304_0506_0708, 0xA0B0C0D0);
        let encoded = frame.encode();
        assert_eq!(encoded[0], Command::ConnectionEstablished as u8);
        assert_eq!(
            u64::from_le_bytes(encoded[1..9].try_into().unwrap()),
            0x0102_0304_0506_0708
        );
        assert_eq!(
            u32::from_le_bytes(encoded[9..13].try_into().unwrap()),
            0xA0B0C0D0
        );
    }

    #[test]
    fn data_id_is_stable_and_content_sensitive() {
        let a = data_id(b"payload");
        assert_eq!(a, data_id(b"payload"));
        assert_ne!(a, data_id(b"payloae"));
    }

    #[test]
    fn ping_is_empty() {
        let encoded = Frame::ping().encode();
        assert_eq!(&encoded[..], &[Command::Ping as u8]);
    }
}
