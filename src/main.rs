//! mongobridge - transparent TCP proxy for MongoDB replica sets
//!
//! Discovers a replica set from seed addresses, opens one local listener
//! per member, and rewrites topology answers so clients only ever see
//! proxy addresses.

use mongobridge_proxy::{metrics, tls, BackendTls, Config, ExtensionStack, Metrics, QueryLogger};
use mongobridge_topology::{HealthChecker, StateManager};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MONGOBRIDGE_CONFIG is set, then
    // env overrides)
    let mut config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("MONGOBRIDGE_CONFIG") {
                tracing::info!("loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    // With X.509 and no explicit username, the username is the subject of
    // the client certificate presented to the backends.
    if config.credentials.mechanism == mongobridge_proxy::auth::MECHANISM_X509
        && config.credentials.username.is_empty()
    {
        if let Some(cert_path) = config.tls.backend.client_cert_path.clone() {
            match tls::certificate_subject(&cert_path) {
                Ok(subject) => {
                    tracing::info!("parsed certificate subject as username: {}", subject);
                    config.credentials.username = subject;
                }
                Err(e) => {
                    tracing::error!("unable to parse certificate subject: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    tracing::info!("starting mongobridge");
    tracing::info!("  seeds: {}", config.topology.seed_addrs.join(","));
    tracing::info!(
        "  listen: {} ports {}-{}",
        config.network.listen_addr,
        config.network.port_start,
        config.network.port_end
    );
    if config.topology.replica_set_name.is_empty() {
        tracing::info!("  replica set: first seen");
    } else {
        tracing::info!("  replica set: {}", config.topology.replica_set_name);
    }
    if config.credentials.username.is_empty() {
        tracing::info!("  authentication: disabled");
    } else {
        // The password never reaches the log.
        tracing::info!(
            "  authentication: {} (mechanism {:?})",
            config.credentials.username,
            config.credentials.mechanism
        );
    }
    if config.query.read_only {
        tracing::info!("  readonly mode: enabled");
    }
    if config.query.proxy_all_queries {
        tracing::info!("  proxying all queries");
    }

    // Listener-side TLS
    let tls_acceptor = if config.tls.listener.enabled {
        let acceptor = tls::create_tls_acceptor(&config.tls.listener)?;
        tracing::info!("  listener TLS: enabled");
        Some(Arc::new(acceptor))
    } else {
        tracing::info!("  listener TLS: disabled");
        None
    };

    // Backend-side TLS
    let backend_tls = if config.tls.backend.enabled {
        tracing::info!("  backend TLS: enabled");
        Some(Arc::new(BackendTls::from_settings(&config.tls.backend)?))
    } else {
        tracing::info!("  backend TLS: disabled");
        None
    };

    // The health checker connects to 127.0.0.1, where certificate
    // verification cannot succeed.
    let health_tls = if tls_acceptor.is_some() {
        Some(Arc::new(BackendTls::insecure(None)?))
    } else {
        None
    };

    // Metrics
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let m = Arc::new(Metrics::new()?);
        let addr = config.metrics.bind_addr;
        let server_metrics = m.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(addr, server_metrics, shutdown_rx).await {
                tracing::error!("metrics server failed: {}", e);
            }
        });
        Some((m, handle))
    } else {
        None
    };
    let proxy_metrics = metrics_handle.as_ref().map(|(m, _)| m.clone());

    // Extensions
    let mut extensions: Vec<Box<dyn mongobridge_proxy::ProxyExtension>> = Vec::new();
    if config.query.log_queries {
        extensions.push(Box::new(QueryLogger));
    }
    let extension_stack = Arc::new(ExtensionStack::new(extensions));

    let health_interval = config.topology.health_check_interval();
    let health_threshold = config.topology.failed_health_check_threshold;

    // Wire up and start the manager
    let manager = StateManager::new(
        config,
        tls_acceptor,
        backend_tls,
        health_tls,
        extension_stack,
        proxy_metrics,
    );
    manager.start().await?;

    // Topology synchronization, fed by the health checker
    let (sync_tx, sync_rx) = tokio::sync::mpsc::channel::<()>(1);
    let sync_handle = tokio::spawn(manager.clone().keep_synchronized(sync_rx));

    // Health checking
    let health_manager = manager.clone();
    let mut health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        let checker = HealthChecker::new(health_interval, health_threshold);
        checker
            .run(&*health_manager, &sync_tx, &mut health_shutdown)
            .await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal, stopping proxies...");

    let _ = shutdown_tx.send(());
    manager.stop_all(false).await;
    sync_handle.abort();
    let _ = health_handle.await;
    if let Some((_, handle)) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("stopped");
    Ok(())
}
