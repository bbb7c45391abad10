//! Framing for the two phases of a connection: NUL-terminated handshake messages, then
//! token-tagged query frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const MAX_HANDSHAKE_MESSAGE: usize = 64 * 1024;
const MAX_FRAME: usize = 64 * 1024 * 1024;
const HEADER_LEN: usize = 12;

/// Handshake messages are JSON (or plain-text errors) terminated by a single NUL byte.
#[derive(Debug, Default)]
pub struct HandshakeCodec {
    scanned: usize,
}

impl Decoder for HandshakeCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(offset) = src[self.scanned..].iter().position(|b| *b == 0) else {
            self.scanned = src.len();
            if src.len() > MAX_HANDSHAKE_MESSAGE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "handshake message too large",
                ));
            }
            return Ok(None);
        };
        let end = self.scanned + offset;
        self.scanned = 0;
        let message = src.split_to(end + 1);
        String::from_utf8(message[..end].to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<String> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(0);
        Ok(())
    }
}

/// One query or response: 8-byte token, 4-byte length (both little-endian), JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn new(token: u64, body: impl Into<Bytes>) -> Self {
        Self {
            token,
            body: body.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryCodec;

impl Decoder for QueryCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..HEADER_LEN];
        let token = header.get_u64_le();
        let len = header.get_u32_le() as usize;
        if len > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        Ok(Some(Frame { token, body }))
    }
}

impl Encoder<Frame> for QueryCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let len = u32::try_from(frame.body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large"))?;
        dst.reserve(HEADER_LEN + frame.body.len());
        dst.put_u64_le(frame.token);
        dst.put_u32_le(len);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_messages_split_on_nul() {
        let mut codec = HandshakeCodec::default();
        let mut buf = BytesMut::from(&b"{\"success\":tr"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ue}\0ERROR\0");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("{\"success\":true}")
        );
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ERROR"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_query_frame_layout() {
        let mut buf = BytesMut::new();
        QueryCodec
            .encode(Frame::new(7, "[2]"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..8], &7u64.to_le_bytes());
        assert_eq!(&buf[8..12], &3u32.to_le_bytes());
        assert_eq!(&buf[12..], b"[2]");
    }

    #[test]
    fn test_partial_frame_waits_for_body() {
        let mut encoded = BytesMut::new();
        QueryCodec
            .encode(Frame::new(1, "{\"t\":3}"), &mut encoded)
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..14]);
        assert_eq!(QueryCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[14..]);
        let frame = QueryCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.token, 1);
        assert_eq!(frame.body, Bytes::from("{\"t\":3}"));
    }
}
