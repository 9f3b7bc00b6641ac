use std::env;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::value::{ParseError, Value};
use crate::Error;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Splits a RESP byte stream into [`Value`] tokens, and writes tokens back as bytes.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    max_frame_size: usize,
}

impl ValueCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: Self::max_frame_size(),
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn max_frame_size() -> usize {
        env::var("MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let value = match Value::parse(&mut cursor, self.max_frame_size) {
            Ok(value) => value,
            Err(ParseError::Incomplete) => {
                // Also bounds header lines that never end.
                if src.len() > self.max_frame_size {
                    return Err(Error::Protocol("frame size exceeds limit".to_string()));
                }
                return Ok(None);
            }
            Err(ParseError::Invalid(err)) => return Err(err),
        };

        let position = cursor.position() as usize;

        // Remove the parsed token from the buffer.
        src.advance(position);

        Ok(Some(value))
    }
}

impl Encoder<Value> for ValueCodec {
    type Error = Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.serialize(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decode_request_token_by_token() {
        let mut codec = ValueCodec::new();
        let mut src = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n"[..]);

        assert_eq!(codec.decode(&mut src).unwrap(), Some(Value::Array(3)));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Value::Bulk(Bytes::from("SET")))
        );
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Value::Bulk(Bytes::from("mykey")))
        );
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Value::Bulk(Bytes::from("myvalue")))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert!(src.is_empty());
    }

    #[test]
    fn decode_waits_for_incomplete_token() {
        let mut codec = ValueCodec::new();
        let mut src = BytesMut::from(&b"$5\r\nmyke"[..]);

        assert_eq!(codec.decode(&mut src).unwrap(), None);
        // Nothing is consumed until the whole token is buffered.
        assert_eq!(src.len(), 8);

        src.extend_from_slice(b"y\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Value::Bulk(Bytes::from("mykey")))
        );
    }

    #[test]
    fn decode_rejects_unterminated_line_beyond_limit() {
        let mut codec = ValueCodec::with_max_frame_size(8);
        let mut src = BytesMut::from(&b"+0123456789"[..]);

        assert!(matches!(codec.decode(&mut src), Err(Error::Protocol(_))));
    }

    #[test]
    fn encode_value() {
        let mut codec = ValueCodec::new();
        let mut dst = BytesMut::new();

        codec.encode(Value::Simple("OK".to_string()), &mut dst).unwrap();
        codec.encode(Value::Integer(42), &mut dst).unwrap();

        assert_eq!(&dst[..], b"+OK\r\n:42\r\n");
    }
}
