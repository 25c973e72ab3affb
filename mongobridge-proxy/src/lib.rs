//! # mongobridge-proxy
//!
//! Per-member proxy machinery for mongobridge.
//!
//! This crate provides:
//! - The backend connection pool with idle/max/retry discipline
//! - The per-client connection limiter
//! - The `getLastError` cache and its pinning rewriter
//! - Response rewriters for `isMaster` and `replSetGetStatus`
//! - The query processor and the per-member proxy instance
//! - MONGODB-CR / MONGODB-X509 backend authentication
//! - TLS acceptor/connector plumbing, Prometheus metrics, configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod extension;
pub mod last_error;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod query;
pub mod rewrite;
pub mod stream;
#[cfg(test)]
pub(crate) mod testutil;
pub mod tls;

pub use auth::Credential;
pub use config::{Config, ConfigError};
pub use error::ProxyError;
pub use extension::{ExtensionStack, ProxyExtension, QueryLogger};
pub use last_error::LastError;
pub use limiter::ClientLimiter;
pub use metrics::Metrics;
pub use pool::{Backend, Pool, PoolConfig, ServerConn};
pub use proxy::{Proxy, ProxyConfig};
pub use query::QueryProcessor;
pub use rewrite::ProxyMapper;
pub use stream::{BackendStream, ClientStream};
pub use tls::BackendTls;
