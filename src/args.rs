//! Lazy, typed access to a sequence of RESP values.
//!
//! [`Args`] backs both the arguments of a request received by the server and the elements of a
//! streamed reply received by the client. Values are decoded one at a time straight from the
//! connection, so a reader must never leave a sequence half consumed: [`Args::close`] discards
//! whatever the consumer did not read and gives the connection reader back to its owner.

use std::collections::VecDeque;
use std::io::Write;
use std::mem;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::codec::FramedRead;

use crate::codec::ValueCodec;
use crate::value::Value;
use crate::{Error, Result};

pub(crate) type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, ValueCodec>;

/// The connection reader, handed back once a stream is done with it.
pub(crate) struct Handoff {
    pub reader: Reader,
    /// Values the stream left unread, which the owner must discard before reading further.
    pub pending: usize,
}

/// Sent exactly once to the owner of a wire-backed stream. An `Err` means the reader failed and
/// the connection cannot be reused.
pub(crate) type Completion = Result<Handoff>;

/// Destination of a value read by [`Args::next`].
///
/// Values that fit none of these, such as nested arrays, fail with [`Error::Unsupported`].
#[derive(Debug)]
pub enum Dest<'a> {
    Bool(&'a mut bool),
    Int(&'a mut i64),
    Uint(&'a mut u64),
    Float(&'a mut f64),
    String(&'a mut String),
    Bytes(&'a mut Vec<u8>),
    /// Reads and drops the value.
    Discard,
}

impl Dest<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Dest::Bool(_) => "bool",
            Dest::Int(_) => "i64",
            Dest::Uint(_) => "u64",
            Dest::Float(_) => "f64",
            Dest::String(_) => "String",
            Dest::Bytes(_) => "Vec<u8>",
            Dest::Discard => "()",
        }
    }

    fn set_zero(self) {
        match self {
            Dest::Bool(b) => *b = false,
            Dest::Int(i) => *i = 0,
            Dest::Uint(u) => *u = 0,
            Dest::Float(f) => *f = 0.0,
            Dest::String(s) => s.clear(),
            Dest::Bytes(v) => v.clear(),
            Dest::Discard => {}
        }
    }
}

impl<'a> From<&'a mut bool> for Dest<'a> {
    fn from(b: &'a mut bool) -> Self {
        Dest::Bool(b)
    }
}

impl<'a> From<&'a mut i64> for Dest<'a> {
    fn from(i: &'a mut i64) -> Self {
        Dest::Int(i)
    }
}

impl<'a> From<&'a mut u64> for Dest<'a> {
    fn from(u: &'a mut u64) -> Self {
        Dest::Uint(u)
    }
}

impl<'a> From<&'a mut f64> for Dest<'a> {
    fn from(f: &'a mut f64) -> Self {
        Dest::Float(f)
    }
}

impl<'a> From<&'a mut String> for Dest<'a> {
    fn from(s: &'a mut String) -> Self {
        Dest::String(s)
    }
}

impl<'a> From<&'a mut Vec<u8>> for Dest<'a> {
    fn from(v: &'a mut Vec<u8>) -> Self {
        Dest::Bytes(v)
    }
}

enum Source {
    Memory(VecDeque<Value>),
    Wire(Reader),
    Gone,
}

/// A forward-only cursor over RESP values.
///
/// Errors are sticky: once a read fails, or the peer sent an error value where a value was
/// expected, `next` keeps returning `false` and `close` reports the error.
pub struct Args {
    source: Source,
    remaining: usize,
    // Elements of nested arrays that were skipped over and still sit on the wire.
    nested: usize,
    error: Option<Error>,
    // Set when reading from the source failed, the reader is then unusable.
    broken: bool,
    closed: Option<Result<()>>,
    done: Option<oneshot::Sender<Completion>>,
    read_timeout: Option<Duration>,
    scratch: Vec<u8>,
}

impl Args {
    /// Creates an argument list from a sequence of values held in memory.
    pub fn list<I, V>(values: I) -> Args
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: VecDeque<Value> = values.into_iter().map(Into::into).collect();
        let remaining = values.len();
        Args::new(Source::Memory(values), remaining, None, None)
    }

    /// Creates an argument list that holds no values and reports `err` when closed.
    pub fn failed(err: Error) -> Args {
        let mut args = Args::new(Source::Gone, 0, None, None);
        args.error = Some(err);
        args
    }

    /// Creates a stream over the next `len` values of `reader`. The reader comes back through
    /// `done` once the stream is closed or dropped.
    pub(crate) fn wire(
        reader: Reader,
        len: usize,
        read_timeout: Option<Duration>,
        done: oneshot::Sender<Completion>,
    ) -> Args {
        Args::new(Source::Wire(reader), len, read_timeout, Some(done))
    }

    fn new(
        source: Source,
        remaining: usize,
        read_timeout: Option<Duration>,
        done: Option<oneshot::Sender<Completion>>,
    ) -> Args {
        Args {
            source,
            remaining,
            nested: 0,
            error: None,
            broken: false,
            closed: None,
            done,
            read_timeout,
            scratch: Vec::with_capacity(128),
        }
    }

    /// Returns the number of values left to read.
    pub fn len(&self) -> usize {
        if self.error.is_some() || self.closed.is_some() {
            return 0;
        }
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the next value into `dst`, returning `false` when the list is exhausted or in error.
    pub async fn next<'a>(&mut self, dst: impl Into<Dest<'a>>) -> bool {
        if self.len() == 0 {
            return false;
        }

        if let Err(err) = self.skip_nested().await {
            self.error = Some(err);
            return false;
        }

        let value = match self.read().await {
            Ok(value) => value,
            Err(err) => {
                self.error = Some(err);
                return false;
            }
        };
        self.remaining -= 1;

        match self.decode(value, dst.into()) {
            Ok(()) => true,
            Err(err) => {
                self.error = Some(err);
                false
            }
        }
    }

    /// Closes the list, returning any error that occurred while reading it.
    ///
    /// Values left unread are discarded first. Only the first call does any work, later calls
    /// return the same result.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(res) = &self.closed {
            return res.clone();
        }

        let drained = if self.broken {
            Ok(())
        } else {
            self.discard().await
        };

        let res = match (self.error.take(), drained) {
            (Some(err), _) | (None, Err(err)) => Err(err),
            (None, Ok(())) => Ok(()),
        };

        if let Some(done) = self.done.take() {
            let completion = match mem::replace(&mut self.source, Source::Gone) {
                Source::Wire(reader) if !self.broken => Ok(Handoff { reader, pending: 0 }),
                _ => Err(res.clone().err().unwrap_or(Error::ConnectionClosed)),
            };
            let _ = done.send(completion);
        }

        self.source = Source::Gone;
        self.remaining = 0;
        self.nested = 0;
        self.closed = Some(res.clone());
        res
    }

    /// Reads values into `dsts` in order, then closes the list.
    pub async fn parse<'a, I>(&mut self, dsts: I) -> Result<()>
    where
        I: IntoIterator<Item = Dest<'a>>,
    {
        for dst in dsts {
            if !self.next(dst).await {
                break;
            }
        }
        self.close().await
    }

    /// Reads a single integer and closes the list.
    pub async fn parse_int(&mut self) -> Result<i64> {
        let mut i = 0;
        self.parse([Dest::Int(&mut i)]).await?;
        Ok(i)
    }

    /// Reads a single string and closes the list.
    pub async fn parse_string(&mut self) -> Result<String> {
        let mut s = String::new();
        self.parse([Dest::String(&mut s)]).await?;
        Ok(s)
    }

    async fn read(&mut self) -> Result<Value> {
        let read_timeout = self.read_timeout;

        let res = match &mut self.source {
            Source::Memory(values) => {
                return values
                    .pop_front()
                    .ok_or_else(|| Error::Protocol("argument list exhausted".to_string()))
            }
            Source::Wire(reader) => match read_timeout {
                Some(timeout) => match time::timeout(timeout, reader.next()).await {
                    Ok(next) => next,
                    Err(_) => Some(Err(Error::Timeout("read"))),
                },
                None => reader.next().await,
            },
            Source::Gone => None,
        };

        match res {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => {
                self.broken = true;
                Err(err)
            }
            None => {
                self.broken = true;
                Err(Error::ConnectionClosed)
            }
        }
    }

    async fn discard(&mut self) -> Result<()> {
        let mut reply_error = None;

        while self.remaining > 0 || self.nested > 0 {
            let value = self.read().await?;

            if self.nested > 0 {
                self.nested -= 1;
            } else {
                self.remaining -= 1;
            }

            match value {
                Value::Array(n) => self.nest(n)?,
                Value::Error(msg) if reply_error.is_none() => reply_error = Some(Error::Resp(msg)),
                _ => {}
            }
        }

        match reply_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops the elements of nested arrays read into [`Dest::Discard`].
    async fn skip_nested(&mut self) -> Result<()> {
        while self.nested > 0 {
            let value = self.read().await?;
            self.nested -= 1;
            if let Value::Array(n) = value {
                self.nest(n)?;
            }
        }
        Ok(())
    }

    /// Accounts for the elements of a nested array, which are left on the wire.
    fn nest(&mut self, n: usize) -> Result<()> {
        match self.nested.checked_add(n) {
            Some(nested) => {
                self.nested = nested;
                Ok(())
            }
            None => {
                // Elements can no longer be skipped, the reader is lost.
                self.broken = true;
                Err(overflow())
            }
        }
    }

    fn decode(&mut self, value: Value, dst: Dest<'_>) -> Result<()> {
        self.scratch.clear();

        match value {
            Value::Error(msg) => return Err(Error::Resp(msg)),
            Value::Array(n) => {
                self.nest(n)?;
                return match dst {
                    Dest::Discard => Ok(()),
                    dst => Err(Error::Unsupported {
                        kind: "array",
                        dest: dst.type_name(),
                    }),
                };
            }
            Value::Null => {
                dst.set_zero();
                return Ok(());
            }
            Value::Simple(s) => self.scratch.extend_from_slice(s.as_bytes()),
            Value::Bulk(b) => self.scratch.extend_from_slice(&b),
            Value::Integer(i) => write!(self.scratch, "{}", i)?,
        }

        let b = &self.scratch[..];
        match dst {
            Dest::Bool(v) => *v = parse_number::<i64>(b, "integer")? != 0,
            Dest::Int(v) => *v = parse_number(b, "integer")?,
            Dest::Uint(v) => *v = parse_number(b, "unsigned integer")?,
            Dest::Float(v) => *v = parse_number(b, "float")?,
            Dest::String(v) => {
                v.clear();
                v.push_str(std::str::from_utf8(b)?);
            }
            Dest::Bytes(v) => {
                v.clear();
                v.extend_from_slice(b);
            }
            Dest::Discard => {}
        }

        Ok(())
    }
}

impl Drop for Args {
    fn drop(&mut self) {
        // Abandoned without `close`: the owner discards what is left.
        if let Some(done) = self.done.take() {
            let pending = self.remaining.checked_add(self.nested);
            let completion = match (mem::replace(&mut self.source, Source::Gone), pending) {
                (Source::Wire(reader), Some(pending)) if !self.broken => {
                    Ok(Handoff { reader, pending })
                }
                (_, None) => Err(overflow()),
                _ => Err(self.error.clone().unwrap_or(Error::ConnectionClosed)),
            };
            let _ = done.send(completion);
        }
    }
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("remaining", &self.remaining)
            .field("error", &self.error)
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

fn overflow() -> Error {
    Error::Protocol("nested array lengths overflow".to_string())
}

fn parse_number<T: std::str::FromStr>(b: &[u8], expected: &'static str) -> Result<T> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse {
            expected,
            value: String::from_utf8_lossy(b).into_owned(),
        })
}

/// Discards `pending` values from `reader`, including the elements of nested arrays.
pub(crate) async fn skip(reader: &mut Reader, mut pending: usize) -> Result<()> {
    while pending > 0 {
        match reader.next().await {
            Some(Ok(Value::Array(n))) => pending = pending.checked_add(n).ok_or_else(overflow)?,
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err),
            None => return Err(Error::ConnectionClosed),
        }
        pending -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reader(data: &'static [u8]) -> Reader {
        let io: Box<dyn AsyncRead + Send + Unpin> = Box::new(data);
        FramedRead::new(io, ValueCodec::new())
    }

    #[tokio::test]
    async fn read_typed_values_from_list() {
        let mut args = Args::list([
            Value::from("key"),
            Value::from(42),
            Value::from("-7"),
            Value::from("1.5"),
            Value::from(true),
            Value::from(Bytes::from("raw")),
        ]);

        let mut key = String::new();
        let mut u = 0u64;
        let mut i = 0i64;
        let mut f = 0f64;
        let mut b = false;
        let mut raw = Vec::new();

        assert_eq!(args.len(), 6);
        assert!(args.next(&mut key).await);
        assert!(args.next(&mut u).await);
        assert!(args.next(&mut i).await);
        assert!(args.next(&mut f).await);
        assert!(args.next(&mut b).await);
        assert!(args.next(&mut raw).await);
        assert!(!args.next(Dest::Discard).await);

        assert_eq!(key, "key");
        assert_eq!(u, 42);
        assert_eq!(i, -7);
        assert_eq!(f, 1.5);
        assert!(b);
        assert_eq!(raw, b"raw");
        assert!(args.close().await.is_ok());
    }

    #[tokio::test]
    async fn parse_failure_is_sticky() {
        let mut args = Args::list(["abc", "1"]);
        let mut i = 0i64;

        assert!(!args.next(&mut i).await);
        assert_eq!(args.len(), 0);
        assert!(!args.next(&mut i).await);

        let err = args.close().await.unwrap_err();
        assert!(matches!(err, Error::Parse { expected: "integer", ref value } if value == "abc"));
    }

    #[tokio::test]
    async fn error_value_becomes_sticky_error() {
        let mut args = Args::list([
            Value::from(1),
            Value::Error("ERR boom".to_string()),
            Value::from(3),
        ]);
        let mut i = 0i64;

        assert!(args.next(&mut i).await);
        assert!(!args.next(&mut i).await);
        assert!(!args.next(&mut i).await);

        assert!(matches!(args.close().await, Err(Error::Resp(ref msg)) if msg == "ERR boom"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut args = Args::failed(Error::Protocol("bad".to_string()));

        assert_eq!(args.len(), 0);
        let first = args.close().await.unwrap_err().to_string();
        let second = args.close().await.unwrap_err().to_string();
        assert_eq!(first, second);

        let mut args = Args::list([1, 2]);
        assert!(args.close().await.is_ok());
        assert!(args.close().await.is_ok());
        assert_eq!(args.len(), 0);
        assert!(!args.next(Dest::Discard).await);
    }

    #[tokio::test]
    async fn null_reads_as_zero_value() {
        let mut args = Args::list([Value::Null, Value::Null]);
        let mut s = String::from("stale");
        let mut i = 9i64;

        assert!(args.next(&mut s).await);
        assert!(args.next(&mut i).await);
        assert_eq!(s, "");
        assert_eq!(i, 0);
    }

    #[tokio::test]
    async fn close_discards_unread_values_and_hands_reader_back() {
        let (tx, rx) = oneshot::channel();
        let mut args = Args::wire(reader(b":1\r\n:2\r\n:3\r\n+NEXT\r\n"), 3, None, tx);

        let mut i = 0i64;
        assert!(args.next(&mut i).await);
        assert_eq!(i, 1);
        assert_eq!(args.len(), 2);

        assert!(args.close().await.is_ok());
        assert_eq!(args.len(), 0);

        let mut handoff = rx.await.unwrap().unwrap();
        assert_eq!(handoff.pending, 0);
        assert_eq!(
            handoff.reader.next().await.unwrap().unwrap(),
            Value::Simple("NEXT".to_string())
        );
    }

    #[tokio::test]
    async fn close_skips_nested_arrays() {
        let (tx, rx) = oneshot::channel();
        let data = b"$1\r\na\r\n*2\r\n:1\r\n*1\r\n:2\r\n$1\r\nb\r\n+NEXT\r\n";
        let mut args = Args::wire(reader(data), 3, None, tx);

        let mut s = String::new();
        assert!(args.next(&mut s).await);
        assert!(!args.next(&mut s).await);
        assert!(matches!(
            args.close().await,
            Err(Error::Unsupported { kind: "array", dest: "String" })
        ));

        let mut handoff = rx.await.unwrap().unwrap();
        assert_eq!(
            handoff.reader.next().await.unwrap().unwrap(),
            Value::Simple("NEXT".to_string())
        );
    }

    #[tokio::test]
    async fn close_reports_error_values_met_while_discarding() {
        let (tx, rx) = oneshot::channel();
        let mut args = Args::wire(reader(b"-ERR nope\r\n"), 1, None, tx);

        assert!(matches!(args.close().await, Err(Error::Resp(ref msg)) if msg == "ERR nope"));
        assert_eq!(rx.await.unwrap().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn dropping_unclosed_stream_reports_pending_values() {
        let (tx, rx) = oneshot::channel();
        let mut args = Args::wire(reader(b":1\r\n:2\r\n:3\r\n"), 3, None, tx);

        assert!(args.next(Dest::Discard).await);
        drop(args);

        let mut handoff = rx.await.unwrap().unwrap();
        assert_eq!(handoff.pending, 2);
        assert!(skip(&mut handoff.reader, handoff.pending).await.is_ok());
        assert!(handoff.reader.next().await.is_none());
    }

    #[tokio::test]
    async fn huge_array_lengths_are_rejected() {
        let (tx, rx) = oneshot::channel();
        let data = b"*9223372036854775807\r\n*9223372036854775807\r\n*9223372036854775807\r\n";
        let mut args = Args::wire(reader(data), 1, None, tx);

        assert!(matches!(args.close().await, Err(Error::Protocol(_))));
        assert!(rx.await.unwrap().is_err());
    }

    fn unbounded_reader(data: &'static [u8]) -> Reader {
        let io: Box<dyn AsyncRead + Send + Unpin> = Box::new(data);
        FramedRead::new(io, ValueCodec::with_max_frame_size(usize::MAX))
    }

    #[tokio::test]
    async fn nested_length_overflow_breaks_the_reader() {
        let data = b"*9223372036854775807\r\n*9223372036854775807\r\n*9223372036854775807\r\n";

        let (tx, rx) = oneshot::channel();
        let mut args = Args::wire(unbounded_reader(data), 1, None, tx);
        assert!(matches!(args.close().await, Err(Error::Protocol(_))));
        assert!(rx.await.unwrap().is_err());

        let mut reader = unbounded_reader(data);
        assert!(matches!(skip(&mut reader, 1).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn discarded_array_is_skipped_before_next_value() {
        let mut args = Args::list([
            Value::Array(2),
            Value::Integer(1),
            Value::Array(1),
            Value::Integer(2),
            Value::from("after"),
        ]);
        // The list only announces its top-level values.
        args.remaining = 2;

        let mut s = String::new();
        assert!(args.next(Dest::Discard).await);
        assert!(args.next(&mut s).await);
        assert_eq!(s, "after");
        assert!(args.close().await.is_ok());
    }

    #[tokio::test]
    async fn truncated_stream_breaks_the_reader() {
        let (tx, rx) = oneshot::channel();
        let mut args = Args::wire(reader(b":1\r\n"), 2, None, tx);

        assert!(args.next(Dest::Discard).await);
        assert!(!args.next(Dest::Discard).await);
        assert!(matches!(args.close().await, Err(Error::ConnectionClosed)));
        assert!(rx.await.unwrap().is_err());
    }
}
