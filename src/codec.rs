use bytes::{Buf, BytesMut};
use std::env;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::reply::{FrameError, Reply};
use crate::request::Request;
use crate::Error;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Decodes replies and encodes requests for a framed TCP stream.
pub struct RespCodec {
    max_frame_size: usize,
}

impl RespCodec {
    pub fn new() -> RespCodec {
        RespCodec {
            max_frame_size: max_frame_size(),
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> RespCodec {
        RespCodec { max_frame_size }
    }
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn max_frame_size() -> usize {
    env::var("MAX_FRAME_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > self.max_frame_size {
            return Err(FrameError::TooLarge(src.len()).into());
        }

        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor) {
            Ok(reply) => reply,
            Err(FrameError::Incomplete) => return Ok(None), // Not enough data to parse a frame.
            Err(err) => return Err(err.into()),
        };

        // Remove the parsed frame from the buffer.
        let position = cursor.position() as usize;
        src.advance(position);

        Ok(Some(reply))
    }
}

impl Encoder<Request> for RespCodec {
    type Error = Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        request.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*2\r\n$1\r\na\r\n$1"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 13);

        buf.put_slice(b"\r\nb\r\n:1\r\n");

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Array(Some(vec![
                Reply::Bulk(Some(Bytes::from("a"))),
                Reply::Bulk(Some(Bytes::from("b"))),
            ])))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Reply::Integer(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_keeps_error_replies_as_values() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"-ERR unknown command\r\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Error("ERR unknown command".to_string()))
        );
    }

    #[test]
    fn decode_rejects_unknown_tags() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::UnknownTag(b'!'))));
    }

    #[test]
    fn decode_enforces_frame_size_limit() {
        let mut codec = RespCodec::with_max_frame_size(8);
        let mut buf = BytesMut::from(&b"$10\r\n0123456789\r\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::TooLarge(17))));
    }

    #[test]
    fn decode_rejects_deeply_nested_arrays() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*1\r\n".repeat(100_000)[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::Invalid(ref msg)) if msg == "nesting too deep"));
    }

    #[test]
    fn decode_bounds_a_bulk_string_that_never_arrives() {
        let mut codec = RespCodec::with_max_frame_size(64);
        let mut buf = BytesMut::from(&b"$1000000\r\nabc"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.put_slice(&[b'x'; 64]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::TooLarge(_))));
    }

    #[test]
    fn encode_appends_to_buffer() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Request::new("GET").arg("a"), &mut buf).unwrap();
        codec.encode(Request::new("PING"), &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*1\r\n$4\r\nPING\r\n"
        );
    }
}
