//! Proxy error types.

use thiserror::Error;

/// Errors raised by the proxy machinery.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] mongobridge_protocol::ProtocolError),

    #[error("could not connect to {addr}")]
    ConnectFailed { addr: String },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unknown authentication mechanism: {0}")]
    UnknownMechanism(String),

    #[error("mongo {0} is not in the replica set")]
    NotInReplicaSet(String),

    #[error("message proxy timed out")]
    MessageTimeout,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ProxyError {
    /// Returns whether this error was caused by a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::MessageTimeout => true,
            ProxyError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
