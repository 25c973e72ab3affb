//! Backend connection pool.
//!
//! Connections are owned exclusively by the pool until acquired, and by
//! exactly one serve loop afterwards. `max` is a hard ceiling on live
//! connections; `min_idle` connections are kept warm by a maintenance task
//! that also reaps idle connections past their timeout. Closing happens on
//! a bounded set of worker tasks because shutting down a TLS connection can
//! block.

use crate::auth::{login, Credential};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::stream::BackendStream;
use crate::tls::BackendTls;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// TCP connect timeout for a single dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of dial attempts before giving up.
const DIAL_ATTEMPTS: u32 = 7;

/// First retry sleep; doubled after every failed attempt. Seven failed
/// attempts back off for about 6.4 s combined, on top of the per-attempt
/// connect timeout.
const DIAL_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// How often the maintenance task reaps and replenishes.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard ceiling on live connections.
    pub max: usize,
    /// Idle connections kept warm.
    pub min_idle: usize,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
    /// Number of closing workers.
    pub close_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 100,
            min_idle: 1,
            idle_timeout: Duration::from_secs(3600),
            close_pool_size: 1,
        }
    }
}

/// Dials authenticated connections to one replica-set member.
#[derive(Clone)]
pub struct Backend {
    pub addr: String,
    pub tls: Option<Arc<BackendTls>>,
    pub credential: Option<Credential>,
    pub metrics: Option<Arc<Metrics>>,
}

impl Backend {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            credential: None,
            metrics: None,
        }
    }

    /// One dial attempt: TCP with a 1 s timeout, optional TLS, then login
    /// when credentials are configured.
    async fn connect_once(&self) -> Result<BackendStream, ProxyError> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                ))
            })??;
        tcp.set_nodelay(true).ok();

        let mut stream = match &self.tls {
            Some(tls) => tls.connect(&self.addr, tcp).await?,
            None => BackendStream::Plain { stream: tcp },
        };

        if let Some(cred) = self.credential.as_ref().filter(|c| c.is_configured()) {
            login(&mut stream, cred).await?;
        }
        Ok(stream)
    }

    /// Dials with exponential backoff, as the pool's connection factory.
    pub async fn connect(&self) -> Result<BackendStream, ProxyError> {
        let mut sleep = DIAL_RETRY_SLEEP;
        for attempt in 1..=DIAL_ATTEMPTS {
            match self.connect_once().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(addr = %self.addr, attempt, "backend dial failed: {}", e);
                    if let Some(m) = &self.metrics {
                        m.dial_retries_total.inc();
                    }
                }
            }
            tokio::time::sleep(sleep).await;
            sleep *= 2;
        }
        Err(ProxyError::ConnectFailed {
            addr: self.addr.clone(),
        })
    }
}

struct IdleConn {
    stream: BackendStream,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleConn>,
    /// Live connections: idle plus checked out plus being dialed.
    total: usize,
    closed: bool,
}

struct PoolInner {
    backend: Backend,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection or a slot becomes available.
    available: Notify,
    close_tx: mpsc::Sender<BackendStream>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A backend connection checked out of the pool.
///
/// Must be given back with [`Pool::release`] or [`Pool::discard`]; dropping
/// it outright counts as a discard.
pub struct ServerConn {
    stream: Option<BackendStream>,
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn")
            .field("stream", &self.stream)
            .finish()
    }
}

impl std::ops::Deref for ServerConn {
    type Target = BackendStream;
    fn deref(&self) -> &BackendStream {
        self.stream.as_ref().expect("connection already returned")
    }
}

impl std::ops::DerefMut for ServerConn {
    fn deref_mut(&mut self) -> &mut BackendStream {
        self.stream.as_mut().expect("connection already returned")
    }
}

impl Drop for ServerConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.inner.forget(stream);
        }
    }
}

/// Bounded pool of authenticated backend connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(backend: Backend, config: PoolConfig) -> Self {
        let (close_tx, close_rx) = mpsc::channel::<BackendStream>(64);
        let inner = Arc::new(PoolInner {
            backend,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            available: Notify::new(),
            close_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let close_rx = Arc::new(tokio::sync::Mutex::new(close_rx));
        let mut tasks = Vec::new();
        for _ in 0..inner.config.close_pool_size.max(1) {
            let rx = close_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let stream = rx.lock().await.recv().await;
                    match stream {
                        Some(mut s) => {
                            if let Err(e) = s.shutdown().await {
                                tracing::warn!("error closing backend connection: {}", e);
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        let maintenance = Arc::downgrade(&inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = maintenance.upgrade() else {
                    break;
                };
                if inner.state.lock().closed {
                    break;
                }
                inner.reap_idle();
                inner.replenish().await;
            }
        }));

        *inner.tasks.lock() = tasks;
        Self { inner }
    }

    /// Returns an open backend connection, waiting when the pool is at its
    /// ceiling.
    pub async fn acquire(&self) -> Result<ServerConn, ProxyError> {
        loop {
            let notified = self.inner.available.notified();
            let dial = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(ProxyError::PoolClosed);
                }
                if let Some(idle) = state.idle.pop() {
                    return Ok(ServerConn {
                        stream: Some(idle.stream),
                        inner: self.inner.clone(),
                    });
                }
                if state.total < self.inner.config.max {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if dial {
                match self.inner.backend.connect().await {
                    Ok(stream) => {
                        return Ok(ServerConn {
                            stream: Some(stream),
                            inner: self.inner.clone(),
                        })
                    }
                    Err(e) => {
                        self.inner.state.lock().total -= 1;
                        self.inner.available.notify_one();
                        return Err(e);
                    }
                }
            }

            notified.await;
        }
    }

    /// Returns a healthy connection to the idle set.
    pub fn release(&self, mut conn: ServerConn) {
        let stream = conn.stream.take().expect("connection already returned");
        let mut state = self.inner.state.lock();
        if state.closed {
            state.total -= 1;
            drop(state);
            self.inner.send_to_closer(stream);
            return;
        }
        state.idle.push(IdleConn {
            stream,
            since: Instant::now(),
        });
        drop(state);
        self.inner.available.notify_one();
    }

    /// Closes a connection that hit an error and frees its slot.
    pub fn discard(&self, mut conn: ServerConn) {
        let stream = conn.stream.take().expect("connection already returned");
        self.inner.forget(stream);
    }

    /// Drains the pool. Idle connections are closed; pending and future
    /// acquires fail with `PoolClosed`.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.total -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_waiters();
        for conn in idle {
            self.inner.send_to_closer(conn.stream);
        }
    }

    /// Number of idle connections, for inspection.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Number of live connections, for inspection.
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().total
    }
}

impl PoolInner {
    /// Drops a connection from the books and hands it to a closer.
    fn forget(&self, stream: BackendStream) {
        self.state.lock().total -= 1;
        self.available.notify_one();
        self.send_to_closer(stream);
    }

    fn send_to_closer(&self, stream: BackendStream) {
        if let Err(e) = self.close_tx.try_send(stream) {
            // Closer backlog is full; shut down inline on a fresh task.
            if let mpsc::error::TrySendError::Full(mut s) = e {
                tokio::spawn(async move {
                    let _ = s.shutdown().await;
                });
            }
        }
    }

    /// Closes idle connections older than the idle timeout.
    fn reap_idle(&self) {
        let stale = {
            let mut state = self.state.lock();
            let timeout = self.config.idle_timeout;
            let mut stale = Vec::new();
            let mut i = 0;
            while i < state.idle.len() {
                if state.idle[i].since.elapsed() > timeout {
                    stale.push(state.idle.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            state.total -= stale.len();
            stale
        };
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "reaping idle backend connections");
            self.available.notify_waiters();
            for conn in stale {
                self.send_to_closer(conn.stream);
            }
        }
    }

    /// Dials until `min_idle` warm connections exist, capacity permitting.
    async fn replenish(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() >= self.config.min_idle
                    || state.total >= self.config.max
                {
                    return;
                }
                state.total += 1;
            }
            match self.backend.connect().await {
                Ok(stream) => {
                    let mut state = self.state.lock();
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        self.send_to_closer(stream);
                        return;
                    }
                    state.idle.push(IdleConn {
                        stream,
                        since: Instant::now(),
                    });
                    drop(state);
                    self.available.notify_one();
                }
                Err(e) => {
                    self.state.lock().total -= 1;
                    tracing::warn!(addr = %self.backend.addr, "warm-up dial failed: {}", e);
                    return;
                }
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// A backend that accepts and holds connections, counting them.
    async fn sink_backend() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted)
    }

    fn small_pool(addr: &str, max: usize) -> Pool {
        Pool::new(
            Backend::new(addr),
            PoolConfig {
                max,
                min_idle: 0,
                idle_timeout: Duration::from_secs(60),
                close_pool_size: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let (addr, accepted) = sink_backend().await;
        let pool = small_pool(&addr, 4);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.total_count(), 1);
        pool.release(conn);
        assert_eq!(pool.idle_count(), 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        // The second acquire came from the idle set, not a new dial.
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_is_a_hard_ceiling() {
        let (addr, _) = sink_backend().await;
        let pool = small_pool(&addr, 1);

        let held = pool.acquire().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.acquire()).await;
        assert!(blocked.is_err(), "second acquire must wait at max");

        pool.release(held);
        let conn = tokio::time::timeout(Duration::from_millis(500), pool.acquire())
            .await
            .expect("acquire should succeed after release")
            .unwrap();
        drop(conn);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let (addr, accepted) = sink_backend().await;
        let pool = small_pool(&addr, 1);

        let conn = pool.acquire().await.unwrap();
        pool.discard(conn);
        assert_eq!(pool.total_count(), 0);

        let _conn = pool.acquire().await.unwrap();
        // A discard forces the next acquire to dial anew.
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_conn_counts_as_discard() {
        let (addr, _) = sink_backend().await;
        let pool = small_pool(&addr, 1);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.total_count(), 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failed_after_retries() {
        // Nothing listens on this address; paused time makes the backoff
        // sleeps instant.
        let backend = Backend::new("127.0.0.1:9");
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let (addr, _) = sink_backend().await;
        let pool = small_pool(&addr, 2);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);

        pool.close().await;
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            ProxyError::PoolClosed
        ));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_min_idle_replenished() {
        let (addr, accepted) = sink_backend().await;
        let pool = Pool::new(
            Backend::new(&addr),
            PoolConfig {
                max: 4,
                min_idle: 2,
                idle_timeout: Duration::from_secs(60),
                close_pool_size: 1,
            },
        );

        // The maintenance tick runs every second.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}
