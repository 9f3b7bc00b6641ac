// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

static CRLF: &[u8; 2] = b"\r\n";

/// A single RESP token.
///
/// Arrays are not materialized: `Array(n)` is the header announcing that the next `n` tokens are
/// the elements, which lets a reader hand elements to the consumer one at a time.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(usize),
}

#[derive(Debug)]
pub(crate) enum ParseError {
    /// Not enough data is available to parse an entire token.
    Incomplete,
    Invalid(Error),
}

impl From<Error> for ParseError {
    fn from(err: Error) -> Self {
        ParseError::Invalid(err)
    }
}

impl Value {
    /// Parses one token from `src`, advancing the cursor past it.
    pub(crate) fn parse(src: &mut Cursor<&[u8]>, max_bulk: usize) -> Result<Self, ParseError> {
        // The first byte in an RESP-serialized payload always identifies its type.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?;
                Ok(Value::Simple(utf8(line)?.to_string()))
            }
            DataType::SimpleError => {
                let line = get_line(src)?;
                Ok(Value::Error(utf8(line)?.to_string()))
            }
            DataType::Integer => {
                let line = get_line(src)?;
                Ok(Value::Integer(parse_decimal(line)?))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match get_length(src, max_bulk)? {
                None => Ok(Value::Null),
                Some(len) => Ok(Value::Bulk(Bytes::copy_from_slice(get_payload(src, len)?))),
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => match get_length(src, max_bulk)? {
                None => Ok(Value::Null),
                Some(len) => Ok(Value::Error(utf8(get_payload(src, len)?)?.to_string())),
            },
            // *<number-of-elements>\r\n
            // Element counts share the bulk limit.
            DataType::Array => match get_length(src, max_bulk)? {
                None => Ok(Value::Null),
                Some(len) => Ok(Value::Array(len)),
            },
            DataType::Null => {
                get_line(src)?;
                Ok(Value::Null)
            }
        }
    }

    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Value::Simple(s) => {
                dst.put_u8(u8::from(DataType::SimpleString));
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Value::Error(s) => {
                dst.put_u8(u8::from(DataType::SimpleError));
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Value::Integer(i) => {
                dst.put_u8(u8::from(DataType::Integer));
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Value::Bulk(bytes) => {
                let length = bytes.len().to_string();
                dst.reserve(1 + length.len() + bytes.len() + 2 * CRLF.len());
                dst.put_u8(u8::from(DataType::BulkString));
                dst.extend_from_slice(length.as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(bytes);
                dst.extend_from_slice(CRLF);
            }
            // RESP2 null bulk string, understood by every client.
            Value::Null => dst.extend_from_slice(b"$-1\r\n"),
            Value::Array(len) => {
                dst.put_u8(u8::from(DataType::Array));
                dst.extend_from_slice(len.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
        }
    }

    /// Converts the value to the bulk string form used for request arguments.
    pub(crate) fn into_argument(self) -> Value {
        match self {
            Value::Simple(s) => Value::Bulk(Bytes::from(s)),
            Value::Integer(i) => Value::Bulk(Bytes::from(i.to_string())),
            Value::Null => Value::Bulk(Bytes::new()),
            value => value,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Simple(_) => "simple string",
            Value::Error(_) => "error",
            Value::Integer(_) => "integer",
            Value::Bulk(_) => "bulk string",
            Value::Null => "null",
            Value::Array(_) => "array",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Simple(s) => write!(f, "+{}", s),
            Value::Error(s) => write!(f, "-{}", s),
            Value::Integer(i) => write!(f, ":{}", i),
            Value::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Value::Null => write!(f, "$-1"),
            Value::Array(len) => write!(f, "*{}", len),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bulk(Bytes::from(s))
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bulk(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bulk(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bulk(Bytes::copy_from_slice(bytes))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Bulk(Bytes::from(u.to_string())),
        }
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Self {
        Value::from(u as u64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Bulk(Bytes::from(f.to_string()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(i64::from(b))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    let end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(ParseError::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

/// Reads a `<length>\r\n` header, `None` standing for the `-1` null marker.
fn get_length(src: &mut Cursor<&[u8]>, max: usize) -> Result<Option<usize>, ParseError> {
    let length = parse_decimal(get_line(src)?)?;

    match length {
        -1 => Ok(None),
        n if n < 0 => Err(Error::Protocol(format!("invalid length {}", n)).into()),
        n if n as u64 > max as u64 => {
            Err(Error::Protocol(format!("length {} exceeds limit of {}", n, max)).into())
        }
        n => Ok(Some(n as usize)),
    }
}

fn get_payload<'a>(src: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    if buf.len() < start + len + CRLF.len() {
        return Err(ParseError::Incomplete);
    }
    if &buf[start + len..start + len + CRLF.len()] != CRLF {
        return Err(Error::Protocol("bulk payload not terminated by CRLF".to_string()).into());
    }

    src.set_position((start + len + CRLF.len()) as u64);

    Ok(&buf[start..start + len])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}

fn utf8(bytes: &[u8]) -> Result<&str, Error> {
    Ok(std::str::from_utf8(bytes)?)
}

fn parse_decimal(bytes: &[u8]) -> Result<i64, Error> {
    utf8(bytes)?
        .parse::<i64>()
        .map_err(|_| Error::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(bytes))))
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    BulkError,    // '!'
    Array,        // '*'
    // RESP3 null, accepted on input only.
    Null, // '_'
}

impl TryFrom<u8> for DataType {
    type Error = ParseError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'!' => Ok(Self::BulkError),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            _ => Err(Error::Protocol(format!("invalid data type byte {:?}", byte as char)).into()),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::BulkError => b'!',
            DataType::Array => b'*',
            DataType::Null => b'_',
        }
    }
}
