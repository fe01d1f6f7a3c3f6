use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;
use std::fmt;

use crate::reply::CRLF;
use crate::Error;

/// A single request argument.
///
/// Everything is sent as a bulk string: text as UTF-8, numbers in decimal and
/// symbols by name.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Text(String),
    Integer(i64),
    Float(f64),
    Symbol(&'static str),
}

impl Arg {
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        match self {
            Arg::Bytes(bytes) => Ok(bytes.clone()),
            Arg::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Arg::Integer(i) => Ok(Bytes::from(i.to_string())),
            Arg::Float(f) if f.is_finite() => Ok(Bytes::from(f.to_string())),
            Arg::Float(f) => Err(Error::InvalidArgument(format!("{} is not a finite number", f))),
            Arg::Symbol(symbol) => Ok(Bytes::from_static(symbol.as_bytes())),
        }
    }
}

impl From<Bytes> for Arg {
    fn from(bytes: Bytes) -> Self {
        Arg::Bytes(bytes)
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(bytes: &[u8; N]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(bytes))
    }
}

impl From<&str> for Arg {
    fn from(text: &str) -> Self {
        Arg::Text(text.to_string())
    }
}

impl From<String> for Arg {
    fn from(text: String) -> Self {
        Arg::Text(text)
    }
}

impl From<&String> for Arg {
    fn from(text: &String) -> Self {
        Arg::Text(text.clone())
    }
}

macro_rules! integer_arg {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(i: $t) -> Self {
                    Arg::Integer(i as i64)
                }
            }
        )*
    };
}

integer_arg!(i8, i16, i32, i64, u8, u16, u32);

// Values beyond i64 keep their exact decimal form.
macro_rules! wide_integer_arg {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(i: $t) -> Self {
                    match i64::try_from(i) {
                        Ok(i) => Arg::Integer(i),
                        Err(_) => Arg::Text(i.to_string()),
                    }
                }
            }
        )*
    };
}

wide_integer_arg!(u64, usize, isize);

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Float(f)
    }
}

impl From<f32> for Arg {
    fn from(f: f32) -> Self {
        Arg::Float(f as f64)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Bytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Arg::Text(text) => write!(f, "{}", text),
            Arg::Integer(i) => write!(f, "{}", i),
            Arg::Float(x) => write!(f, "{}", x),
            Arg::Symbol(symbol) => write!(f, "{}", symbol),
        }
    }
}

/// A command and its arguments, encoded as a RESP array of bulk strings.
///
/// ```
/// use respite::Request;
///
/// let request = Request::new("SET").arg("key").arg(42);
/// assert_eq!(
///     &request.encode().unwrap()[..],
///     b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n42\r\n"
/// );
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    command: Arg,
    args: Vec<Arg>,
}

impl Request {
    pub fn new(command: impl Into<Arg>) -> Request {
        Request {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Request {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Request
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command(&self) -> &Arg {
        &self.command
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` for the command and each argument.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut dst = BytesMut::new();
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    pub(crate) fn encode_into(&self, dst: &mut BytesMut) -> Result<(), Error> {
        // Encode every argument before writing so a bad one leaves `dst` untouched.
        let parts = std::iter::once(&self.command)
            .chain(self.args.iter())
            .map(Arg::to_bytes)
            .collect::<Result<Vec<_>, _>>()?;

        dst.put_u8(b'*');
        dst.put_slice(parts.len().to_string().as_bytes());
        dst.put_slice(CRLF);
        for part in parts {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(CRLF);
            dst.put_slice(&part);
            dst.put_slice(CRLF);
        }

        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            std::iter::once(&self.command).chain(self.args.iter()).join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_command_without_arguments() {
        let request = Request::new("PING");

        assert_eq!(&request.encode().unwrap()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn encode_mixed_arguments() {
        let request = Request::new("SET")
            .arg(b"k\r\n")
            .arg(String::from("é"))
            .arg(-5)
            .arg(1.5)
            .arg(Arg::Symbol("NX"));

        assert_eq!(
            &request.encode().unwrap()[..],
            &b"*6\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n$2\r\n\xc3\xa9\r\n$2\r\n-5\r\n$3\r\n1.5\r\n$2\r\nNX\r\n"[..]
        );
    }

    #[test]
    fn encode_rejects_non_finite_floats() {
        let request = Request::new("INCRBYFLOAT").arg("k").arg(f64::NAN);

        assert!(matches!(request.encode(), Err(Error::InvalidArgument(_))));

        let request = Request::new("INCRBYFLOAT").arg("k").arg(f64::INFINITY);
        let mut dst = BytesMut::new();
        assert!(request.encode_into(&mut dst).is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn wide_integers_keep_their_value() {
        assert_eq!(Arg::from(7u64), Arg::Integer(7));
        assert_eq!(
            Arg::from(u64::MAX).to_bytes().unwrap(),
            Bytes::from(u64::MAX.to_string())
        );
    }

    #[test]
    fn keys_normalize_to_the_same_bytes() {
        let expected = Bytes::from("news");

        assert_eq!(Arg::from("news").to_bytes().unwrap(), expected);
        assert_eq!(Arg::Symbol("news").to_bytes().unwrap(), expected);
        assert_eq!(Arg::from(b"news".to_vec()).to_bytes().unwrap(), expected);
    }

    #[test]
    fn display_renders_the_command_line() {
        let request = Request::new("GET").args(["a", "b"]);

        assert_eq!(request.to_string(), "GET a b");
    }
}
