use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::connection::{Connection, Reservation};
use crate::context::Context;
use crate::Result;

pub const DEFAULT_CONNS_PER_HOST: usize = 4;
pub const DEFAULT_MAX_PIPELINE: usize = 128;

/// Configuration for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of connections opened to a single address.
    pub conns_per_host: usize,
    /// Maximum number of requests waiting for a reply on a single connection.
    pub max_pipeline: usize,
    /// Idle connections send a `PING` once they have been quiet for this long.
    pub ping_interval: Option<Duration>,
    /// Connections whose ping is not answered within this delay are evicted. Defaults to the
    /// ping interval.
    pub ping_timeout: Option<Duration>,
    /// Bounds the TCP connect of new connections.
    pub dial_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            conns_per_host: DEFAULT_CONNS_PER_HOST,
            max_pipeline: DEFAULT_MAX_PIPELINE,
            ping_interval: None,
            ping_timeout: None,
            dial_timeout: None,
        }
    }
}

/// Shares pooled, pipelined connections between every client using it.
///
/// For each address the transport reuses an idle connection when there is one, opens a new
/// connection while under [`conns_per_host`](TransportConfig::conns_per_host), and otherwise
/// pipelines onto the least loaded connection. When every connection already carries
/// [`max_pipeline`](TransportConfig::max_pipeline) requests, callers wait for one to complete.
#[derive(Clone, Default)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

#[derive(Default)]
struct TransportInner {
    config: TransportConfig,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
    next_id: AtomicU64,
}

pub(crate) struct Pool {
    addr: String,
    state: Mutex<PoolState>,
    capacity: Notify,
}

#[derive(Default)]
struct PoolState {
    conns: Vec<Arc<Connection>>,
    dialing: usize,
}

enum Pick {
    Ready(Reservation),
    Dial,
    Wait,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                config,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns a connection to `addr` with a request slot reserved on it.
    pub(crate) async fn connection(&self, ctx: &Context, addr: &str) -> Result<Reservation> {
        let pool = self.pool(addr);
        let config = &self.inner.config;

        loop {
            // Registered before looking at the pool so a release in between is not missed.
            let released = pool.capacity.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match pool.pick(config) {
                Pick::Ready(conn) => return Ok(conn),
                Pick::Wait => {
                    ctx.run(async {
                        released.as_mut().await;
                        Ok(())
                    })
                    .await?;
                }
                Pick::Dial => {
                    let slot = DialSlot(&pool);
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = ctx
                        .run(Connection::dial(id, &pool.addr, config, Arc::downgrade(&pool)))
                        .await?;

                    let reservation = Reservation::new(conn.clone());
                    pool.lock().conns.push(conn);
                    drop(slot);
                    return Ok(reservation);
                }
            }
        }
    }

    /// Closes every idle connection now, and every busy one once its last call completes.
    pub fn close_idle_connections(&self) {
        let pools: Vec<Arc<Pool>> = self.lock_pools().drain().map(|(_, pool)| pool).collect();

        for pool in pools {
            let conns = std::mem::take(&mut pool.lock().conns);
            for conn in conns {
                if conn.is_idle() {
                    conn.close();
                } else {
                    conn.mark_closing();
                }
            }
            pool.released();
        }
    }

    fn pool(&self, addr: &str) -> Arc<Pool> {
        let addr = addr.strip_prefix("tcp://").unwrap_or(addr);

        self.lock_pools()
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(Pool {
                    addr: addr.to_string(),
                    state: Mutex::new(PoolState::default()),
                    capacity: Notify::new(),
                })
            })
            .clone()
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<String, Arc<Pool>>> {
        self.inner
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counts a dial in progress against `conns_per_host` until dropped.
struct DialSlot<'a>(&'a Pool);

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        self.0.lock().dialing -= 1;
        self.0.released();
    }
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pick(&self, config: &TransportConfig) -> Pick {
        let mut state = self.lock();
        state
            .conns
            .retain(|conn| !conn.is_closed() && !conn.is_closing());

        if let Some(conn) = state.conns.iter().find(|conn| conn.is_idle()) {
            return Pick::Ready(Reservation::new(conn.clone()));
        }

        if state.conns.len() + state.dialing < config.conns_per_host.max(1) {
            state.dialing += 1;
            return Pick::Dial;
        }

        match state
            .conns
            .iter()
            .filter(|conn| conn.in_flight() < config.max_pipeline.max(1))
            .min_by_key(|conn| conn.in_flight())
        {
            Some(conn) => Pick::Ready(Reservation::new(conn.clone())),
            None => Pick::Wait,
        }
    }

    /// Wakes callers waiting for capacity.
    pub(crate) fn released(&self) {
        self.capacity.notify_waiters();
    }

    pub(crate) fn remove(&self, id: u64) {
        self.lock().conns.retain(|conn| conn.id != id);
        debug!(id, addr = %self.addr, "connection removed from pool");
        self.released();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::value::Value;

    /// Accepts connections and answers every request with `+PONG` once per request header seen.
    async fn pong_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (accepted_tx, accepted_rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = accepted_tx.send(());
                tokio::spawn(async move {
                    let mut buf = vec![0; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let requests = buf[..n].iter().filter(|b| **b == b'*').count();
                        for _ in 0..requests {
                            if socket.write_all(b"+PONG\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        (addr, accepted_rx)
    }

    /// Accepts connections and reads from them without ever answering.
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn reuses_idle_connection() {
        let (addr, mut accepted) = pong_server().await;
        let transport = Transport::default();
        let ctx = Context::background();

        for _ in 0..3 {
            let conn = transport.connection(&ctx, &addr).await.unwrap();
            let rx = conn.send(vec![Value::from("PING")]).await.unwrap();
            let mut args = rx.await.unwrap().unwrap();
            args.close().await.unwrap();
        }

        accepted.recv().await.unwrap();
        assert!(accepted.try_recv().is_err());
        assert_eq!(transport.pool(&addr).len(), 1);
    }

    #[tokio::test]
    async fn bounds_connections_per_host() {
        let (addr, _accepted) = pong_server().await;
        let transport = Transport::new(TransportConfig {
            conns_per_host: 2,
            max_pipeline: 1,
            ..Default::default()
        });
        let ctx = Context::background();

        let first = transport.connection(&ctx, &addr).await.unwrap();
        let second = transport.connection(&ctx, &addr).await.unwrap();
        let first_id = first.id;
        assert_ne!(first_id, second.id);

        // Both connections are at their pipeline limit, the next caller has to wait.
        let waiting = ctx.with_timeout(Duration::from_millis(50));
        assert!(matches!(
            transport.connection(&waiting, &addr).await,
            Err(crate::Error::DeadlineExceeded)
        ));

        let rx = first.send(vec![Value::from("PING")]).await.unwrap();
        rx.await.unwrap().unwrap().close().await.unwrap();

        let third = transport.connection(&ctx, &addr).await.unwrap();
        assert_eq!(third.id, first_id);
        assert_eq!(transport.pool(&addr).len(), 2);
    }

    #[tokio::test]
    async fn close_idle_connections_empties_the_pool() {
        let (addr, _accepted) = pong_server().await;
        let transport = Transport::default();
        let ctx = Context::background();

        let idle = transport.connection(&ctx, &addr).await.unwrap();
        let idle_id = idle.id;
        let rx = idle.send(vec![Value::from("PING")]).await.unwrap();
        rx.await.unwrap().unwrap().close().await.unwrap();

        let busy = transport.connection(&ctx, &addr).await.unwrap();
        assert_eq!(busy.id, idle_id);
        let other = transport.connection(&ctx, &addr).await.unwrap();
        assert_ne!(other.id, idle_id);
        let (busy_conn, other_conn) = (busy.connection().clone(), other.connection().clone());

        transport.close_idle_connections();

        // Both connections hold a reservation, so they are only marked.
        assert!(!busy_conn.is_closed());
        assert!(!other_conn.is_closed());

        let rx = busy.send(vec![Value::from("PING")]).await.unwrap();
        rx.await.unwrap().unwrap().close().await.unwrap();
        assert!(busy_conn.is_closed());

        let rx = other.send(vec![Value::from("PING")]).await.unwrap();
        rx.await.unwrap().unwrap().close().await.unwrap();
        assert!(other_conn.is_closed());

        assert_eq!(transport.pool(&addr).len(), 0);
    }

    #[tokio::test]
    async fn dropped_dial_gives_its_slot_back() {
        let (addr, _accepted) = pong_server().await;
        let transport = Transport::new(TransportConfig {
            conns_per_host: 1,
            ..Default::default()
        });
        let ctx = Context::background();

        // Polled once, then dropped mid-connect.
        drop(transport.connection(&ctx, &addr).now_or_never());
        assert_eq!(transport.pool(&addr).lock().dialing, 0);

        let waiting = ctx.with_timeout(Duration::from_millis(300));
        let conn = transport.connection(&waiting, &addr).await.unwrap();
        assert_eq!(conn.in_flight(), 1);
    }

    #[tokio::test]
    async fn dropped_reservation_is_released() {
        let (addr, _accepted) = pong_server().await;
        let transport = Transport::default();
        let ctx = Context::background();

        let reservation = transport.connection(&ctx, &addr).await.unwrap();
        let conn = reservation.connection().clone();
        assert!(!conn.is_idle());

        drop(reservation);
        assert!(conn.is_idle());

        transport.close_idle_connections();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn unanswered_ping_evicts_only_that_connection() {
        let stalled_addr = silent_server().await;
        let (live_addr, _accepted) = pong_server().await;
        let transport = Transport::new(TransportConfig {
            ping_interval: Some(Duration::from_millis(20)),
            ping_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let ctx = Context::background();

        let stalled = transport
            .connection(&ctx, &stalled_addr)
            .await
            .unwrap()
            .connection()
            .clone();
        let live = transport
            .connection(&ctx, &live_addr)
            .await
            .unwrap()
            .connection()
            .clone();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(stalled.is_closed());
        assert_eq!(transport.pool(&stalled_addr).len(), 0);
        assert!(!live.is_closed());
        assert_eq!(transport.pool(&live_addr).len(), 1);
    }
}
