//! A pooled client connection.
//!
//! Requests are written by the callers themselves, one at a time under the write turn, and each
//! one pushes a [`Pending`] entry onto the connection's queue while holding that turn. RESP has no
//! correlation ids, so the order of that queue is the only thing tying a reply to its caller: the
//! background reader takes entries off the queue in order and routes each reply it decodes to the
//! oldest one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::args::{self, Args, Reader};
use crate::codec::ValueCodec;
use crate::response::Writer;
use crate::transport::{Pool, TransportConfig};
use crate::value::Value;
use crate::{Error, Result};

pub(crate) enum Pending {
    Call(oneshot::Sender<Result<Args>>),
    Ping,
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    writer: tokio::sync::Mutex<Writer>,
    queue: mpsc::UnboundedSender<Pending>,
    // Calls reserved on this connection whose reply has not been fully consumed yet.
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
    closing: AtomicBool,
    closed: CancellationToken,
    pool: Weak<Pool>,
}

impl Connection {
    /// Opens a connection to `addr` and starts its reader.
    pub(crate) async fn dial(
        id: u64,
        addr: &str,
        config: &TransportConfig,
        pool: Weak<Pool>,
    ) -> Result<Arc<Connection>> {
        let socket = match config.dial_timeout {
            Some(timeout) => time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Timeout("dial"))??,
            None => TcpStream::connect(addr).await?,
        };
        // Requests are small and latency bound.
        socket.set_nodelay(true)?;

        let (read_half, write_half) = socket.into_split();
        let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        let (queue, pending) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id,
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, ValueCodec::new())),
            queue,
            in_flight: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            pool,
        });

        let reader = FramedRead::new(read_half, ValueCodec::new());
        let keepalive = config.ping_interval.map(|interval| Keepalive {
            interval,
            timeout: config.ping_timeout.unwrap_or(interval),
        });
        tokio::spawn(read_loop(conn.clone(), reader, pending, keepalive, addr.to_string()));

        debug!(id, addr, "dialed connection");
        Ok(conn)
    }

    fn reserve(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if prev == 1 && self.closing.load(Ordering::SeqCst) {
            self.close();
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.released();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Closes the connection once its last pending call completes.
    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.is_idle() {
            self.close();
        }
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    /// Sends a keepalive ping if the write turn is free, skipping the tick otherwise.
    async fn ping(&self) -> Result<()> {
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(());
        };

        self.reserve();
        if self.queue.send(Pending::Ping).is_err() {
            self.release();
            return Err(Error::ConnectionClosed);
        }
        write_request(&mut writer, vec![Value::from("PING")]).await?;
        self.touch();
        Ok(())
    }
}

/// A request slot taken on a connection.
///
/// Dropped before its request is queued, the slot is given back. Once queued, the reader releases
/// it when the reply has been consumed.
pub(crate) struct Reservation {
    conn: Arc<Connection>,
    queued: bool,
}

impl Reservation {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        conn.reserve();
        Self {
            conn,
            queued: false,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Writes a request and queues its caller, returning where the reply will be delivered.
    pub(crate) async fn send(
        mut self,
        request: Vec<Value>,
    ) -> Result<oneshot::Receiver<Result<Args>>> {
        let conn = self.conn.clone();
        let (tx, rx) = oneshot::channel();

        let mut writer = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => return Err(Error::ConnectionClosed),
            writer = conn.writer.lock() => writer,
        };

        if conn.queue.send(Pending::Call(tx)).is_err() {
            return Err(Error::ConnectionClosed);
        }
        self.queued = true;

        let mut write = UnfinishedWrite {
            conn: &conn,
            done: false,
        };
        let res = write_request(&mut writer, request).await;
        write.done = res.is_ok();
        drop(write);
        drop(writer);

        res?;
        conn.touch();
        Ok(rx)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.queued {
            self.conn.release();
        }
    }
}

impl std::ops::Deref for Reservation {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

/// Closes the connection unless the request it guards was written in full.
struct UnfinishedWrite<'a> {
    conn: &'a Connection,
    done: bool,
}

impl Drop for UnfinishedWrite<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.close();
        }
    }
}

async fn write_request(writer: &mut Writer, request: Vec<Value>) -> Result<()> {
    writer.feed(Value::Array(request.len())).await?;
    for value in request {
        writer.feed(value.into_argument()).await?;
    }
    writer.flush().await
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

#[instrument(name = "connection", skip_all, fields(id = conn.id, addr = %addr))]
async fn read_loop(
    conn: Arc<Connection>,
    reader: Reader,
    mut pending: mpsc::UnboundedReceiver<Pending>,
    keepalive: Option<Keepalive>,
    addr: String,
) {
    match route_replies(&conn, reader, &mut pending, keepalive).await {
        Ok(()) => debug!("connection closed"),
        Err(err) => warn!(cause = %err, "connection evicted"),
    }

    conn.close();
    if let Some(pool) = conn.pool.upgrade() {
        pool.remove(conn.id);
    }

    // Callers still queued see their reply slot dropped.
    pending.close();
    while let Ok(call) = pending.try_recv() {
        drop(call);
        conn.release();
    }
}

async fn route_replies(
    conn: &Connection,
    mut reader: Reader,
    pending: &mut mpsc::UnboundedReceiver<Pending>,
    keepalive: Option<Keepalive>,
) -> Result<()> {
    let mut ticker = keepalive.map(|keepalive| {
        let mut ticker = time::interval(keepalive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let call = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => return Ok(()),
            call = pending.recv() => match call {
                Some(call) => call,
                None => return Ok(()),
            },
            _ = tick(&mut ticker) => {
                if let Some(keepalive) = keepalive {
                    if conn.is_idle() && conn.idle_for() >= keepalive.interval {
                        conn.ping().await?;
                    }
                }
                continue;
            }
        };

        match call {
            Pending::Ping => {
                let timeout = keepalive.map_or(Duration::MAX, |keepalive| keepalive.timeout);
                time::timeout(timeout, read_ping_reply(&mut reader))
                    .await
                    .map_err(|_| Error::Timeout("ping"))??;
                conn.touch();
                conn.release();
            }
            Pending::Call(tx) => {
                let value = tokio::select! {
                    biased;
                    _ = conn.closed.cancelled() => return Ok(()),
                    value = reader.next() => value,
                };
                let value = match value {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err.clone()));
                        return Err(err);
                    }
                    None => return Err(Error::ConnectionClosed),
                };
                conn.touch();

                match value {
                    Value::Array(len) => {
                        let (done_tx, done_rx) = oneshot::channel();
                        // A caller that went away drops the stream, which hands the reader back
                        // with everything left to discard.
                        let _ = tx.send(Ok(Args::wire(reader, len, None, done_tx)));

                        let completion = tokio::select! {
                            biased;
                            _ = conn.closed.cancelled() => return Ok(()),
                            completion = done_rx => completion,
                        };
                        let mut handoff = completion.map_err(|_| Error::ConnectionClosed)??;
                        args::skip(&mut handoff.reader, handoff.pending).await?;
                        reader = handoff.reader;
                        conn.touch();
                        conn.release();
                    }
                    value => {
                        // The whole reply is in hand, the slot is free before the caller sees it.
                        conn.release();
                        let _ = tx.send(Ok(Args::list([value])));
                    }
                }
            }
        }

        if conn.is_closed() {
            return Ok(());
        }
    }
}

async fn read_ping_reply(reader: &mut Reader) -> Result<()> {
    match reader.next().await {
        Some(Ok(Value::Array(len))) => args::skip(reader, len).await,
        Some(Ok(_)) => Ok(()),
        Some(Err(err)) => Err(err),
        None => Err(Error::ConnectionClosed),
    }
}

async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}
