use std::sync::Arc;

use crate::args::{Args, Dest};
use crate::connection::Connection;
use crate::context::Context;
use crate::transport::Transport;
use crate::value::Value;
use crate::{Error, Result};

/// Sends commands to a single address over a shared [`Transport`].
#[derive(Clone)]
pub struct Client {
    address: String,
    transport: Transport,
}

impl Client {
    /// Creates a client with a transport of its own. Accepts `host:port` or `tcp://host:port`.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_transport(address, Transport::default())
    }

    pub fn with_transport(address: impl Into<String>, transport: Transport) -> Self {
        Self {
            address: address.into(),
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends a command and discards its reply, returning the first error met on the way: network
    /// failure, malformed reply, error reply, or the end of `ctx`.
    pub async fn exec<I, A>(&self, ctx: &Context, cmd: &str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: Into<Value>,
    {
        self.query(ctx, cmd, args).await.close().await
    }

    /// Sends a command and returns its reply as a stream of values.
    ///
    /// Errors are not returned here but carried by the reply and reported by
    /// [`Reply::close`].
    pub async fn query<I, A>(&self, ctx: &Context, cmd: &str, args: I) -> Reply
    where
        I: IntoIterator<Item = A>,
        A: Into<Value>,
    {
        let mut request = vec![Value::from(cmd)];
        request.extend(args.into_iter().map(Into::into));

        match self.send(ctx, request).await {
            Ok(reply) => reply,
            Err(err) => Reply::failed(err),
        }
    }

    async fn send(&self, ctx: &Context, request: Vec<Value>) -> Result<Reply> {
        let reservation = self.transport.connection(ctx, &self.address).await?;
        let conn = reservation.connection().clone();

        let res = ctx
            .run(async move {
                let reply = reservation.send(request).await?;
                reply.await.map_err(|_| Error::ConnectionClosed)?
            })
            .await;

        match res {
            Ok(args) => Ok(Reply {
                args,
                ctx: ctx.clone(),
                conn: Some(conn),
            }),
            Err(err) => {
                if err.is_cancellation() {
                    // The request may be half written or its reply half read.
                    conn.close();
                }
                Err(err)
            }
        }
    }
}

/// The reply to a [`Client::query`].
///
/// Values are read one at a time from the connection, so the reply holds up every request queued
/// behind it on that connection until it is closed. Dropping a reply without closing it discards
/// the rest in the background. If the context of the query ends while values are still unread,
/// the connection is closed.
pub struct Reply {
    args: Args,
    ctx: Context,
    conn: Option<Arc<Connection>>,
}

impl Reply {
    fn failed(err: Error) -> Self {
        Self {
            args: Args::failed(err),
            ctx: Context::background(),
            conn: None,
        }
    }

    /// Number of values left to read.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Reads the next value into `dst`, returning `false` once the reply is exhausted or failed.
    pub async fn next<'a>(&mut self, dst: impl Into<Dest<'a>>) -> bool {
        if self.args.is_empty() {
            return false;
        }

        let Self { args, ctx, .. } = self;
        let outcome = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            ok = args.next(dst) => Ok(ok),
        };

        match outcome {
            Ok(ok) => ok,
            Err(err) => {
                self.abort(err);
                false
            }
        }
    }

    /// Closes the reply, discarding unread values and returning any error met while reading it.
    /// Later calls return the same result.
    pub async fn close(&mut self) -> Result<()> {
        if !self.args.is_empty() {
            let Self { args, ctx, .. } = self;
            let outcome = tokio::select! {
                biased;
                err = ctx.done() => Err(err),
                res = args.close() => Ok(res),
            };

            if let Err(err) = outcome {
                self.abort(err);
            }
        }

        self.conn = None;
        self.args.close().await
    }

    fn abort(&mut self, err: Error) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.args = Args::failed(err);
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("args", &self.args).finish()
    }
}
