use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::time;
use tokio_util::codec::FramedWrite;

use crate::codec::ValueCodec;
use crate::value::Value;
use crate::{Error, Result};

pub(crate) type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, ValueCodec>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum State {
    /// Nothing written yet.
    Pending,
    /// An array was announced, this many elements are still owed.
    Streaming(usize),
    Done,
}

/// Writes the reply to a single request.
///
/// A reply is either one call to [`write`](ResponseWriter::write), or one call to
/// [`stream`](ResponseWriter::stream) announcing `n` elements followed by exactly `n` calls to
/// `write`. Anything else breaks the framing of the connection: extra writes fail with
/// [`Error::ResponseContract`], and a handler returning while elements are still owed gets its
/// connection closed.
pub struct ResponseWriter<'a> {
    writer: &'a mut Writer,
    write_timeout: Option<Duration>,
    state: State,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(writer: &'a mut Writer, write_timeout: Option<Duration>) -> Self {
        Self {
            writer,
            write_timeout,
            state: State::Pending,
        }
    }

    /// Announces an array reply of exactly `n` elements.
    pub async fn stream(&mut self, n: usize) -> Result<()> {
        if self.state != State::Pending {
            return Err(Error::ResponseContract(
                "stream announced after the reply was started".to_string(),
            ));
        }

        self.send(Value::Array(n)).await?;
        self.state = match n {
            0 => State::Done,
            n => State::Streaming(n),
        };
        Ok(())
    }

    /// Writes a reply value, or the next element of an announced stream.
    ///
    /// Arrays can only be announced through [`stream`](ResponseWriter::stream).
    pub async fn write(&mut self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if let Value::Array(_) = value {
            return Err(Error::ResponseContract(
                "array header written as a value, use stream".to_string(),
            ));
        }

        let next = match self.state {
            State::Pending | State::Streaming(1) => State::Done,
            State::Streaming(n) => State::Streaming(n - 1),
            State::Done => {
                return Err(Error::ResponseContract(
                    "value written after the reply was complete".to_string(),
                ))
            }
        };

        self.send(value).await?;
        self.state = next;
        Ok(())
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    async fn send(&mut self, value: Value) -> Result<()> {
        match self.write_timeout {
            Some(timeout) => time::timeout(timeout, self.writer.send(value))
                .await
                .map_err(|_| Error::Timeout("write"))?,
            None => self.writer.send(value).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn writer() -> (Writer, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let io: Box<dyn AsyncWrite + Send + Unpin> = Box::new(server);
        (FramedWrite::new(io, ValueCodec::new()), client)
    }

    async fn written(mut client: tokio::io::DuplexStream, writer: Writer) -> Vec<u8> {
        drop(writer);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn single_value_reply() {
        let (mut w, client) = writer();
        let mut res = ResponseWriter::new(&mut w, None);

        res.write(Value::Simple("OK".to_string())).await.unwrap();
        assert_eq!(res.state(), State::Done);
        assert!(matches!(
            res.write("again").await,
            Err(Error::ResponseContract(_))
        ));

        assert_eq!(written(client, w).await, b"+OK\r\n");
    }

    #[tokio::test]
    async fn array_header_is_not_a_value() {
        let (mut w, client) = writer();
        let mut res = ResponseWriter::new(&mut w, None);

        assert!(matches!(
            res.write(Value::Array(2)).await,
            Err(Error::ResponseContract(_))
        ));
        assert_eq!(res.state(), State::Pending);

        res.stream(1).await.unwrap();
        assert!(matches!(
            res.write(Value::Array(0)).await,
            Err(Error::ResponseContract(_))
        ));
        assert_eq!(res.state(), State::Streaming(1));
        res.write("x").await.unwrap();

        assert_eq!(written(client, w).await, b"*1\r\n$1\r\nx\r\n");
    }

    #[tokio::test]
    async fn streamed_reply() {
        let (mut w, client) = writer();
        let mut res = ResponseWriter::new(&mut w, None);

        res.stream(3).await.unwrap();
        for i in 1..=3 {
            assert_eq!(res.state(), State::Streaming(4 - i as usize));
            res.write(i).await.unwrap();
        }
        assert_eq!(res.state(), State::Done);
        assert!(res.stream(1).await.is_err());

        assert_eq!(written(client, w).await, b"*3\r\n:1\r\n:2\r\n:3\r\n");
    }

    #[tokio::test]
    async fn empty_stream_completes_the_reply() {
        let (mut w, client) = writer();
        let mut res = ResponseWriter::new(&mut w, None);

        res.stream(0).await.unwrap();
        assert_eq!(res.state(), State::Done);

        assert_eq!(written(client, w).await, b"*0\r\n");
    }
}
