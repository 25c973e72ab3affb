//! Prometheus metrics for mongobridge.
//!
//! This module provides:
//! - Metrics registry with the proxy's counters and gauges
//! - HTTP server to expose metrics at `/metrics`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the proxy.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total client connections accepted.
    pub client_connections_total: Counter,
    /// Currently active client connections.
    pub client_connections_active: Gauge,
    /// Clients rejected by the per-client limit.
    pub clients_rejected_total: Counter,
    /// Proxied messages by op code.
    pub messages_total: CounterVec,
    /// Message proxy failures by kind (timeout or io).
    pub message_errors_total: CounterVec,
    /// Client connections closed for idling.
    pub client_idle_timeouts_total: Counter,
    /// Mutations that pinned a backend connection.
    pub mutations_total: Counter,
    /// Pinned waits that expired without a follow-up.
    pub gle_timeouts_total: Counter,
    /// Writes rejected in readonly mode.
    pub readonly_rejections_total: Counter,
    /// Failed backend dial attempts.
    pub dial_retries_total: Counter,
    /// Topology synchronizations that could not produce a state.
    pub sync_failures_total: Counter,
    /// Failed health checks.
    pub healthcheck_failures_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let client_connections_total = Counter::with_opts(Opts::new(
            "mongobridge_client_connections_total",
            "Total number of client connections accepted",
        ))?;
        registry.register(Box::new(client_connections_total.clone()))?;

        let client_connections_active = Gauge::with_opts(Opts::new(
            "mongobridge_client_connections_active",
            "Number of currently active client connections",
        ))?;
        registry.register(Box::new(client_connections_active.clone()))?;

        let clients_rejected_total = Counter::with_opts(Opts::new(
            "mongobridge_clients_rejected_total",
            "Client connections rejected by the per-client limit",
        ))?;
        registry.register(Box::new(clients_rejected_total.clone()))?;

        let messages_total = CounterVec::new(
            Opts::new("mongobridge_messages_total", "Proxied messages by op code"),
            &["op"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let message_errors_total = CounterVec::new(
            Opts::new(
                "mongobridge_message_errors_total",
                "Message proxy failures by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(message_errors_total.clone()))?;

        let client_idle_timeouts_total = Counter::with_opts(Opts::new(
            "mongobridge_client_idle_timeouts_total",
            "Client connections closed after idling",
        ))?;
        registry.register(Box::new(client_idle_timeouts_total.clone()))?;

        let mutations_total = Counter::with_opts(Opts::new(
            "mongobridge_mutations_total",
            "Mutations that pinned a backend connection",
        ))?;
        registry.register(Box::new(mutations_total.clone()))?;

        let gle_timeouts_total = Counter::with_opts(Opts::new(
            "mongobridge_gle_timeouts_total",
            "Pinned getLastError waits that expired",
        ))?;
        registry.register(Box::new(gle_timeouts_total.clone()))?;

        let readonly_rejections_total = Counter::with_opts(Opts::new(
            "mongobridge_readonly_rejections_total",
            "Writes rejected in readonly mode",
        ))?;
        registry.register(Box::new(readonly_rejections_total.clone()))?;

        let dial_retries_total = Counter::with_opts(Opts::new(
            "mongobridge_dial_retries_total",
            "Failed backend dial attempts",
        ))?;
        registry.register(Box::new(dial_retries_total.clone()))?;

        let sync_failures_total = Counter::with_opts(Opts::new(
            "mongobridge_sync_failures_total",
            "Topology synchronizations that failed to produce a state",
        ))?;
        registry.register(Box::new(sync_failures_total.clone()))?;

        let healthcheck_failures_total = Counter::with_opts(Opts::new(
            "mongobridge_healthcheck_failures_total",
            "Failed health checks",
        ))?;
        registry.register(Box::new(healthcheck_failures_total.clone()))?;

        Ok(Self {
            registry,
            client_connections_total,
            client_connections_active,
            clients_rejected_total,
            messages_total,
            message_errors_total,
            client_idle_timeouts_total,
            mutations_total,
            gle_timeouts_total,
            readonly_rejections_total,
            dial_retries_total,
            sync_failures_total,
            healthcheck_failures_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = if req.uri().path() == "/metrics" {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(metrics.encode())))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap()
    };

    Ok(response)
}
