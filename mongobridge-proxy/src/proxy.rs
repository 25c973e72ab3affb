//! The per-member proxy instance.
//!
//! One proxy fronts one replica-set member: it owns a listener, a backend
//! pool and a per-client limiter. Each accepted client gets its own serve
//! loop. A mutation pins the backend connection until the follow-up
//! `getLastError` arrives or the pinning window expires, because the
//! backend reports write errors per connection.

use crate::error::ProxyError;
use crate::extension::ExtensionStack;
use crate::last_error::LastError;
use crate::limiter::ClientLimiter;
use crate::metrics::Metrics;
use crate::pool::Pool;
use crate::query::QueryProcessor;
use crate::rewrite::GetLastErrorRewriter;
use crate::stream::ClientStream;
use mongobridge_protocol::codec::{copy_exact, copy_message};
use mongobridge_protocol::{MsgHeader, OpCode, ParsedQuery, ProtocolError};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio_rustls::TlsAcceptor;

/// TCP keep-alive period recommended for MongoDB clients.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(120);

/// Per-proxy timeouts and limits, shared replica-set-wide.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long a client may idle between requests.
    pub client_idle_timeout: Duration,
    /// How long a backend stays pinned after a mutation.
    pub get_last_error_timeout: Duration,
    /// Deadline for one message to be proxied.
    pub message_timeout: Duration,
    /// Concurrent connections allowed per client IP.
    pub max_per_client_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_idle_timeout: Duration::from_secs(3600),
            get_last_error_timeout: Duration::from_secs(60),
            message_timeout: Duration::from_secs(120),
            max_per_client_connections: 100,
        }
    }
}

/// Outcome of waiting for a client header.
enum HeaderRead {
    Header(MsgHeader),
    /// EOF or shutdown; not an error.
    Closed,
    TimedOut,
}

/// Counts live serve loops so a soft stop can wait for them.
#[derive(Default)]
struct ConnTracker {
    count: AtomicUsize,
    drained: Notify,
}

impl ConnTracker {
    fn guard(self: &Arc<Self>) -> ConnGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnGuard(self.clone())
    }

    async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

struct ConnGuard(Arc<ConnTracker>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Forwards the wire protocol between clients and one mongo server.
pub struct Proxy {
    proxy_addr: String,
    mongo_addr: String,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    pool: Pool,
    limiter: ClientLimiter,
    processor: Arc<QueryProcessor>,
    config: Arc<ProxyConfig>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    extensions: Arc<ExtensionStack>,
    metrics: Option<Arc<Metrics>>,
    shutdown: broadcast::Sender<()>,
    tracker: Arc<ConnTracker>,
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy {} => mongo {}", self.proxy_addr, self.mongo_addr)
    }
}

impl Proxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        mongo_addr: String,
        pool: Pool,
        processor: Arc<QueryProcessor>,
        config: Arc<ProxyConfig>,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
        extensions: Arc<ExtensionStack>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ProxyError> {
        let proxy_addr = listener.local_addr()?.to_string();
        let (shutdown, _) = broadcast::channel(1);
        let limiter = ClientLimiter::new(config.max_per_client_connections);
        Ok(Self {
            proxy_addr,
            mongo_addr,
            listener: parking_lot::Mutex::new(Some(listener)),
            pool,
            limiter,
            processor,
            config,
            tls_acceptor,
            extensions,
            metrics,
            shutdown,
            tracker: Arc::new(ConnTracker::default()),
        })
    }

    /// Address clients connect to.
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Address of the member this proxy fronts.
    pub fn mongo_addr(&self) -> &str {
        &self.mongo_addr
    }

    /// Spawns the accept loop.
    pub fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            tracing::warn!("{} already started", self);
            return;
        };
        tracing::info!("started {}", self);
        let proxy = self.clone();
        tokio::spawn(proxy.accept_loop(listener));
    }

    /// Stops the proxy: closes the listener, signals serve loops, and
    /// drains the pool. A soft stop waits for serve loops to finish.
    pub async fn stop(&self, hard: bool) {
        // If the accept loop never ran, free the listener here.
        drop(self.listener.lock().take());
        let _ = self.shutdown.send(());
        if !hard {
            self.tracker.wait().await;
        }
        self.pool.close().await;
        tracing::info!("stopped {}", self);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let proxy = self.clone();
                        tokio::spawn(proxy.serve_client(stream, peer));
                    }
                    Err(e) => {
                        tracing::error!("{} accept error: {}", self, e);
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("{} accept loop stopped", self);
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip();
        if self.limiter.inc(ip) {
            if let Some(m) = &self.metrics {
                m.clients_rejected_total.inc();
            }
            tracing::warn!(%peer, "rejecting client connection due to per-client limit");
            return;
        }

        let _guard = self.tracker.guard();
        if let Some(m) = &self.metrics {
            m.client_connections_total.inc();
            m.client_connections_active.inc();
        }
        tracing::debug!(%peer, "client connected to {}", self);

        if let Err(e) = self.serve_inner(stream, peer).await {
            tracing::debug!(%peer, "client connection ended: {}", e);
        }

        if let Some(m) = &self.metrics {
            m.client_connections_active.dec();
        }
        self.limiter.dec(ip);
        tracing::debug!(%peer, "client disconnected from {}", self);
    }

    async fn serve_inner(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::warn!(%peer, "failed to enable keep-alive: {}", e);
        }
        stream.set_nodelay(true).ok();

        let mut client = match &self.tls_acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
                ClientStream::Tls { stream: tls }
            }
            None => ClientStream::Plain { stream },
        };

        let mut shutdown = self.shutdown.subscribe();
        let mut last_error = LastError::new();

        loop {
            let first = match self
                .read_client_header(&mut client, self.config.client_idle_timeout, &mut shutdown)
                .await?
            {
                HeaderRead::Header(h) => h,
                HeaderRead::Closed => return Ok(()),
                HeaderRead::TimedOut => {
                    if let Some(m) = &self.metrics {
                        m.client_idle_timeouts_total.inc();
                    }
                    tracing::debug!(%peer, "client idle timeout");
                    return Ok(());
                }
            };

            let mut server = self.pool.acquire().await?;
            let mut header = first;

            // Pinned loop: a mutation keeps this backend until the
            // follow-up arrives or the window expires.
            loop {
                self.extensions.on_header(&header);
                if let Some(m) = &self.metrics {
                    m.messages_total
                        .with_label_values(&[&header.op_code.to_string()])
                        .inc();
                }

                let mut msg = ParsedQuery::new(header);
                let result = if self.processor.read_only() && header.op_code.is_mutation() {
                    self.reject_readonly(&mut msg, &mut client, &mut server, &mut last_error)
                        .await
                } else {
                    self.proxy_message(&mut msg, &mut client, &mut server, &mut last_error)
                        .await
                };

                if let Err(e) = result {
                    if let Some(m) = &self.metrics {
                        let kind = if e.is_timeout() { "timeout" } else { "io" };
                        m.message_errors_total.with_label_values(&[kind]).inc();
                    }
                    self.pool.discard(server);
                    return Err(e);
                }

                if !header.op_code.is_mutation() {
                    break;
                }
                if self.processor.read_only() {
                    // The mutation was answered locally; nothing to pin.
                    break;
                }
                if let Some(m) = &self.metrics {
                    m.mutations_total.inc();
                }

                match self
                    .read_client_header(
                        &mut client,
                        self.config.get_last_error_timeout,
                        &mut shutdown,
                    )
                    .await
                {
                    Ok(HeaderRead::Header(next)) => header = next,
                    Ok(HeaderRead::Closed) => {
                        self.pool.release(server);
                        return Ok(());
                    }
                    Ok(HeaderRead::TimedOut) => {
                        // No follow-up came; the connection is still good.
                        if let Some(m) = &self.metrics {
                            m.gle_timeouts_total.inc();
                        }
                        break;
                    }
                    Err(e) => {
                        self.pool.release(server);
                        return Err(e);
                    }
                }
            }

            self.pool.release(server);
        }
    }

    /// Waits for the next client header, bounded by `timeout` and
    /// interruptible by shutdown. EOF and shutdown both map to a normal
    /// close.
    async fn read_client_header(
        &self,
        client: &mut ClientStream,
        timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<HeaderRead, ProxyError> {
        tokio::select! {
            result = tokio::time::timeout(timeout, MsgHeader::read_from(client)) => {
                match result {
                    Err(_) => Ok(HeaderRead::TimedOut),
                    Ok(Ok(header)) => Ok(HeaderRead::Header(header)),
                    Ok(Err(ProtocolError::Io(e)))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        Ok(HeaderRead::Closed)
                    }
                    Ok(Err(e)) => Err(e.into()),
                }
            }
            _ = shutdown.recv() => Ok(HeaderRead::Closed),
        }
    }

    /// Proxies one message under the message deadline.
    async fn proxy_message(
        &self,
        msg: &mut ParsedQuery,
        client: &mut ClientStream,
        server: &mut crate::pool::ServerConn,
        last_error: &mut LastError,
    ) -> Result<(), ProxyError> {
        let header = *msg.header();
        let work = async {
            // OP_QUERY may need rewriting; everything else is opaque.
            if header.op_code == OpCode::Query {
                return self
                    .processor
                    .process(msg, client, &mut **server, last_error)
                    .await;
            }

            // Anything besides a getLastError call resets the cache.
            if last_error.exists() {
                tracing::debug!("reset getLastError cache");
                last_error.reset();
            }

            header.write_to(&mut **server).await?;
            copy_exact(&mut **server, client, header.body_len()).await?;

            if header.op_code.has_response() {
                copy_message(client, &mut **server).await?;
            }
            Ok(())
        };

        match tokio::time::timeout(self.config.message_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::MessageTimeout),
        }
    }

    /// Answers a mutation locally in readonly mode. The synthesized error
    /// stays cached so the follow-up `getLastError` is served the same
    /// document without touching the backend.
    async fn reject_readonly(
        &self,
        msg: &mut ParsedQuery,
        client: &mut ClientStream,
        server: &mut crate::pool::ServerConn,
        last_error: &mut LastError,
    ) -> Result<(), ProxyError> {
        if let Some(m) = &self.metrics {
            m.readonly_rejections_total.inc();
        }
        last_error.new_error("Readonly database", 66)?;
        GetLastErrorRewriter
            .rewrite(msg, client, &mut **server, last_error)
            .await
    }
}
