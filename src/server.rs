use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::args::{self, Args, Reader};
use crate::codec::ValueCodec;
use crate::context::Context;
use crate::error::is_temporary;
use crate::handler::{Handler, Request};
use crate::response::{ResponseWriter, State, Writer};
use crate::value::Value;
use crate::{Error, Result};

/// Source of inbound connections for [`Server::serve`].
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Bounds each read of a request token once the request has started.
    pub read_timeout: Option<Duration>,
    /// Bounds each write of a reply value.
    pub write_timeout: Option<Duration>,
    /// Bounds the wait for the next request on an open connection.
    pub idle_timeout: Option<Duration>,
}

/// A RESP server dispatching requests to a [`Handler`].
///
/// Clones share the same state, so one clone can run [`serve`](Server::serve) while another
/// calls [`shutdown`](Server::shutdown) or [`close`](Server::close).
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Box<dyn Handler>,
    config: ServerConfig,
    // Cancelled once the server stops accepting, by either `shutdown` or `close`.
    shutdown: CancellationToken,
    active: watch::Sender<usize>,
    connections: Mutex<HashMap<Uuid, AbortHandle>>,
}

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

impl Server {
    pub fn new(handler: impl Handler, config: ServerConfig) -> Server {
        let (active, _) = watch::channel(0);
        Server {
            inner: Arc::new(Inner {
                handler: Box::new(handler),
                config,
                shutdown: CancellationToken::new(),
                active,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accepts connections from `listener` until the server is shut down or closed.
    ///
    /// Temporary accept errors are logged and retried with a growing delay. Any other accept
    /// error stops the loop and is returned.
    pub async fn serve(&self, mut listener: impl Listener) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        match listener.local_addr() {
            Ok(addr) => info!("accepting inbound connections on {}", addr),
            Err(_) => info!("accepting inbound connections"),
        }

        let mut backoff = Duration::ZERO;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => {
                    info!("stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, client_address) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_temporary(&err) => {
                    backoff = (backoff * 2).clamp(Duration::from_millis(5), MAX_ACCEPT_BACKOFF);
                    warn!(cause = %err, "temporary accept error; retrying in {:?}", backoff);
                    time::sleep(backoff).await;
                    continue;
                }
                Err(err) => {
                    error!(cause = %err, "failed to accept");
                    return Err(err.into());
                }
            };

            backoff = Duration::ZERO;
            info!("Accepted connection from {:?}", client_address);
            self.spawn_connection(socket, client_address);
        }
    }

    /// Stops accepting connections and waits for every connection to go idle and close.
    ///
    /// If `ctx` ends first its error is returned right away; connections still busy keep
    /// running and close once their current request is answered.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.inner.shutdown.cancel();

        let mut active = self.inner.active.subscribe();
        ctx.run(async move {
            active
                .wait_for(|n| *n == 0)
                .await
                .map(|_| ())
                .map_err(|_| Error::ServerClosed)
        })
        .await
    }

    /// Stops accepting connections and drops every active connection immediately.
    pub fn close(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<AbortHandle> = lock(&self.inner.connections)
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            handle.abort();
        }
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> usize {
        *self.inner.active.borrow()
    }

    fn spawn_connection(&self, socket: TcpStream, client_address: SocketAddr) {
        let id = Uuid::new_v4();
        let inner = self.inner.clone();

        // Held while spawning so the task cannot unregister itself before it is registered.
        let mut connections = lock(&self.inner.connections);
        let guard = ConnectionGuard::new(inner.clone(), id);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            match handle_connection(inner, socket, id, client_address).await {
                Ok(()) | Err(Error::ConnectionClosed) => debug!("Connection closed"),
                Err(err) => error!(cause = %err, "connection error"),
            }
        });

        connections.insert(id, handle.abort_handle());
    }
}

/// Keeps the count of active connections, and the registry used by `close`, up to date however
/// the connection task ends.
struct ConnectionGuard {
    inner: Arc<Inner>,
    id: Uuid,
}

impl ConnectionGuard {
    fn new(inner: Arc<Inner>, id: Uuid) -> Self {
        inner.active.send_modify(|n| *n += 1);
        Self { inner, id }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        lock(&self.inner.connections).remove(&self.id);
        self.inner.active.send_modify(|n| *n -= 1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn within<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => time::timeout(timeout, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[instrument(
    name = "connection",
    skip(inner, socket, id, client_address),
    fields(connection_id = %id, client_address = %client_address)
)]
async fn handle_connection(
    inner: Arc<Inner>,
    socket: TcpStream,
    id: Uuid,
    client_address: SocketAddr,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (read_half, write_half) = socket.into_split();

    let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
    let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
    let mut reader: Reader = FramedRead::new(read_half, ValueCodec::new());
    let mut writer: Writer = FramedWrite::new(write_half, ValueCodec::new());

    let config = &inner.config;

    loop {
        // Idle: wait for the next pipelined request.
        let header = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                debug!("closing idle connection for shutdown");
                return Ok(());
            }
            header = within(config.idle_timeout, reader.next()) => header,
        };

        let len = match header {
            None => {
                debug!("idle timeout");
                return Ok(());
            }
            Some(None) => return Ok(()),
            Some(Some(header)) => match header? {
                Value::Array(len) if len > 0 => len,
                value => {
                    return protocol_error(
                        &mut writer,
                        format!("expected non-empty array, got {}", value.kind()),
                    )
                    .await
                }
            },
        };

        // Reading the command name, arguments are left on the wire.
        let cmd = match within(config.read_timeout, reader.next()).await {
            None => return Err(Error::Timeout("read")),
            Some(None) => return Err(Error::ConnectionClosed),
            Some(Some(value)) => match value? {
                Value::Bulk(bytes) => std::str::from_utf8(&bytes)?.to_string(),
                Value::Simple(s) => s,
                value => {
                    return protocol_error(
                        &mut writer,
                        format!("expected command name, got {}", value.kind()),
                    )
                    .await
                }
            },
        };

        // Dispatching.
        let (done_tx, done_rx) = oneshot::channel();
        let mut req = Request {
            cmd,
            args: Args::wire(reader, len - 1, config.read_timeout, done_tx),
        };
        debug!(cmd = %req.cmd, args = len - 1, "received request");

        let mut res = ResponseWriter::new(&mut writer, config.write_timeout);
        let outcome = inner.handler.serve(&mut res, &mut req).await;

        if let Err(err) = req.args.close().await {
            warn!(cmd = %req.cmd, cause = %err, "request arguments");
        }
        let cmd = req.cmd;

        let mut handoff = done_rx.await.map_err(|_| Error::ConnectionClosed)??;
        args::skip(&mut handoff.reader, handoff.pending).await?;
        reader = handoff.reader;

        // Writing whatever the handler did not.
        match (outcome, res.state()) {
            (Ok(()), State::Pending) => res.write(Value::Null).await?,
            (Ok(()), State::Done) => {}
            (Err(err), State::Done) if !is_write_failure(&err) => {
                warn!(cmd = %cmd, cause = %err, "handler failed after replying");
            }
            (Err(err), State::Pending) if !is_write_failure(&err) => {
                warn!(cmd = %cmd, cause = %err, "handler failed");
                res.write(Value::Error(format!("ERR {}", err))).await?;
            }
            (Err(err), _) => return Err(err),
            (Ok(()), State::Streaming(missing)) => {
                error!(cmd = %cmd, missing, "handler returned before completing its stream");
                return Err(Error::ResponseContract(format!(
                    "{} stream elements never written",
                    missing
                )));
            }
        }
        debug!(cmd = %cmd, "reply sent");
    }
}

fn is_write_failure(err: &Error) -> bool {
    matches!(
        err,
        Error::Io(_) | Error::Timeout(_) | Error::ConnectionClosed
    )
}

async fn protocol_error(writer: &mut Writer, msg: String) -> Result<()> {
    let mut res = ResponseWriter::new(writer, None);
    let _ = res
        .write(Value::Error(format!("ERR Protocol error: {}", msg)))
        .await;
    Err(Error::Protocol(msg))
}
