// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::str;
use thiserror::Error as ThisError;

use crate::Error;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

/// Deepest array nesting accepted from the server.
pub const MAX_DEPTH: usize = 512;

/// Largest bulk string accepted from the server, the same as Redis' default `proto-max-bulk-len`.
pub const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError, PartialEq)]
pub enum FrameError {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("unknown reply tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("protocol error; {0}")]
    Invalid(String),
    #[error("frame size {0} exceeds limit")]
    TooLarge(usize),
}

/// A decoded server reply.
///
/// Null bulk strings (`$-1`) and null arrays (`*-1`) are kept apart as
/// `Bulk(None)` and `Array(None)`.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Parses one reply. Arrays nested deeper than [`MAX_DEPTH`] are rejected.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, FrameError> {
        Self::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, FrameError> {
        // The first byte always identifies the type, the rest are its contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?;
                Ok(Reply::Status(to_string(line)?))
            }
            DataType::SimpleError => {
                let line = get_line(src)?;
                Ok(Reply::Error(to_string(line)?))
            }
            DataType::Integer => {
                let line = get_line(src)?;
                Ok(Reply::Integer(to_integer(line)?))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = to_integer(get_line(src)?)?;
                if length == -1 {
                    return Ok(Reply::Bulk(None));
                }
                let length = to_length(length)?;
                if length > MAX_BULK_LENGTH {
                    return Err(FrameError::Invalid(format!(
                        "bulk length {} exceeds limit",
                        length
                    )));
                }

                if src.remaining() < length + CRLF.len() {
                    return Err(FrameError::Incomplete);
                }

                let start = src.position() as usize;
                let buf: &[u8] = src.get_ref();
                let data = &buf[start..start + length];
                if &buf[start + length..start + length + CRLF.len()] != CRLF {
                    return Err(FrameError::Invalid(
                        "bulk string is not terminated by CRLF".to_string(),
                    ));
                }
                let data = Bytes::copy_from_slice(data);
                src.advance(length + CRLF.len());

                Ok(Reply::Bulk(Some(data)))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let length = to_integer(get_line(src)?)?;
                if length == -1 {
                    return Ok(Reply::Array(None));
                }
                let length = to_length(length)?;
                if depth >= MAX_DEPTH {
                    return Err(FrameError::Invalid("nesting too deep".to_string()));
                }

                let mut replies = Vec::with_capacity(length.min(1024));
                for _ in 0..length {
                    replies.push(Self::parse_nested(src, depth + 1)?);
                }

                Ok(Reply::Array(Some(replies)))
            }
        }
    }

    /// Turns an error reply, at any depth, into `Error::Server`.
    pub fn into_result(self) -> Result<Reply, Error> {
        if let Some(message) = self.first_error() {
            return Err(Error::Server(message.to_string()));
        }
        Ok(self)
    }

    fn first_error(&self) -> Option<&str> {
        let mut pending = vec![self];
        while let Some(reply) = pending.pop() {
            match reply {
                Reply::Error(message) => return Some(message),
                Reply::Array(Some(replies)) => pending.extend(replies.iter().rev()),
                _ => {}
            }
        }
        None
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Integer(i) => {
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(i.to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Bulk(None) => bytes.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(data.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Reply::Array(None) => bytes.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(replies)) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(replies.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                for reply in replies {
                    reply.write_to(bytes);
                }
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(Some(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Text of a status reply or a UTF-8 bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            Reply::Bulk(Some(bytes)) => str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(Some(replies)) => Some(replies),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }
}

impl From<Reply> for Vec<u8> {
    fn from(reply: Reply) -> Self {
        reply.serialize()
    }
}

// Mirrors what redis-cli prints.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Reply {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(Some(bytes)) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Reply::Bulk(None) | Reply::Array(None) => write!(f, "(nil)"),
            Reply::Array(Some(replies)) if replies.is_empty() => write!(f, "(empty array)"),
            Reply::Array(Some(replies)) => {
                for (i, reply) in replies.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\n{:indent$}", "", indent = indent)?;
                    }
                    let prefix = format!("{}) ", i + 1);
                    write!(f, "{}", prefix)?;
                    reply.fmt_indented(f, indent + prefix.len())?;
                }
                Ok(())
            }
        }
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], FrameError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(FrameError::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(FrameError::Incomplete);
    }
    Ok(src.get_u8())
}

fn to_string(line: &[u8]) -> Result<String, FrameError> {
    str::from_utf8(line)
        .map(|s| s.to_string())
        .map_err(|_| FrameError::Invalid("invalid UTF-8 in line".to_string()))
}

fn to_integer(line: &[u8]) -> Result<i64, FrameError> {
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            FrameError::Invalid(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn to_length(length: i64) -> Result<usize, FrameError> {
    usize::try_from(length).map_err(|_| FrameError::Invalid(format!("invalid length {}", length)))
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(FrameError::UnknownTag(byte)),
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
            DataType::Array => b'*',
        }
    }
}
