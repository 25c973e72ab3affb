//! Configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MONGOBRIDGE_CONFIG)
//! 3. Environment variables

use crate::auth::Credential;
use crate::pool::PoolConfig;
use crate::proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener network configuration.
    pub network: NetworkConfig,
    /// Backend pool configuration.
    pub pool: PoolSettings,
    /// Client-facing limits and timeouts.
    pub client: ClientSettings,
    /// Replica-set discovery and health checking.
    pub topology: TopologySettings,
    /// Backend credentials.
    pub credentials: CredentialSettings,
    /// TLS configuration.
    pub tls: TlsSettings,
    /// Metrics configuration.
    pub metrics: MetricsSettings,
    /// Query handling flags.
    pub query: QuerySettings,
}

impl Config {
    /// Loads configuration from file, then applies environment variable
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("MONGOBRIDGE_CONFIG") {
            config = Self::from_file(&path)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.pool.apply_env_overrides();
        self.client.apply_env_overrides();
        self.topology.apply_env_overrides();
        self.credentials.apply_env_overrides();
        self.metrics.apply_env_overrides();
        self.query.apply_env_overrides();
    }

    /// Validates the configuration as a whole.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.seed_addrs.is_empty() {
            return Err(ConfigError::Validation(
                "no seed addresses given".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections cannot be 0".to_string(),
            ));
        }
        if self.client.max_per_client_connections == 0 {
            return Err(ConfigError::Validation(
                "max_per_client_connections cannot be 0".to_string(),
            ));
        }
        if self.network.port_start > self.network.port_end {
            return Err(ConfigError::Validation(format!(
                "invalid port range {}-{}",
                self.network.port_start, self.network.port_end
            )));
        }

        let cred = self.credentials.credential();
        if cred.is_configured() {
            cred.validate_mechanism()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        } else if self.credentials.mechanism == crate::auth::MECHANISM_X509
            && self.tls.backend.client_cert_path.is_none()
        {
            // Without an explicit username the X.509 subject is taken from
            // the backend client certificate, so one must be configured.
            return Err(ConfigError::Validation(
                "MONGODB-X509 requires a username or a backend client certificate to derive it from"
                    .to_string(),
            ));
        }

        self.tls.validate()?;
        Ok(())
    }
}

/// Listener network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address proxies listen on. `127.0.0.1` for localhost only,
    /// `0.0.0.0` for a public service.
    pub listen_addr: String,
    /// First port in the proxy allocation range.
    pub port_start: u16,
    /// Last port in the proxy allocation range.
    pub port_end: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port_start: 6000,
            port_end: 6010,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MONGOBRIDGE_LISTEN") {
            self.listen_addr = addr;
        }
        if let Ok(port) = std::env::var("MONGOBRIDGE_PORT_START") {
            if let Ok(p) = port.parse() {
                self.port_start = p;
            }
        }
        if let Ok(port) = std::env::var("MONGOBRIDGE_PORT_END") {
            if let Ok(p) = port.parse() {
                self.port_end = p;
            }
        }
    }
}

/// Backend pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum connections per mongo node.
    pub max_connections: usize,
    /// Idle connections kept warm per node.
    pub min_idle_connections: usize,
    /// Seconds after which an idle server connection is reaped.
    pub server_idle_timeout_secs: u64,
    /// Number of workers closing server connections.
    pub server_close_pool_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_idle_connections: 1,
            server_idle_timeout_secs: 3600,
            server_close_pool_size: 1,
        }
    }
}

impl PoolSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("MONGOBRIDGE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(min) = std::env::var("MONGOBRIDGE_MIN_IDLE_CONNECTIONS") {
            if let Ok(n) = min.parse() {
                self.min_idle_connections = n;
            }
        }
        if let Ok(timeout) = std::env::var("MONGOBRIDGE_SERVER_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.server_idle_timeout_secs = secs;
            }
        }
    }

    /// Pool configuration for one backend.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max: self.max_connections,
            min_idle: self.min_idle_connections,
            idle_timeout: Duration::from_secs(self.server_idle_timeout_secs),
            close_pool_size: self.server_close_pool_size,
        }
    }
}

/// Client-facing limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Seconds a client may idle between requests.
    pub client_idle_timeout_secs: u64,
    /// Concurrent connections allowed from a single client IP.
    pub max_per_client_connections: usize,
    /// Seconds a backend stays pinned waiting for a getLastError.
    pub get_last_error_timeout_secs: u64,
    /// Seconds allowed for one message to be proxied.
    pub message_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_idle_timeout_secs: 3600,
            max_per_client_connections: 100,
            get_last_error_timeout_secs: 60,
            message_timeout_secs: 120,
        }
    }
}

impl ClientSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("MONGOBRIDGE_CLIENT_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.client_idle_timeout_secs = secs;
            }
        }
        if let Ok(max) = std::env::var("MONGOBRIDGE_MAX_PER_CLIENT_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_per_client_connections = n;
            }
        }
        if let Ok(timeout) = std::env::var("MONGOBRIDGE_MESSAGE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.message_timeout_secs = secs;
            }
        }
    }

    /// Per-proxy runtime configuration.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            client_idle_timeout: Duration::from_secs(self.client_idle_timeout_secs),
            get_last_error_timeout: Duration::from_secs(self.get_last_error_timeout_secs),
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            max_per_client_connections: self.max_per_client_connections,
        }
    }
}

/// Replica-set discovery and health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    /// Seed member addresses. Each must be alive and part of the same
    /// replica set, or unreachable.
    pub seed_addrs: Vec<String>,
    /// Replica set name; members of other sets are ignored. Empty accepts
    /// the first set seen.
    pub replica_set_name: String,
    /// Seconds between health checks.
    pub health_check_interval_secs: u64,
    /// Consecutive failures before the process aborts.
    pub failed_health_check_threshold: u32,
    /// Number of localhost proxy ports the health check probes, starting
    /// at `port_start`.
    pub health_check_probe_ports: u16,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            seed_addrs: vec!["localhost:27017".to_string()],
            replica_set_name: String::new(),
            health_check_interval_secs: 5,
            failed_health_check_threshold: 3,
            health_check_probe_ports: 5,
        }
    }
}

impl TopologySettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(addrs) = std::env::var("MONGOBRIDGE_SEEDS") {
            self.seed_addrs = addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(name) = std::env::var("MONGOBRIDGE_REPLICA_SET_NAME") {
            self.replica_set_name = name;
        }
        if let Ok(interval) = std::env::var("MONGOBRIDGE_HEALTH_CHECK_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.health_check_interval_secs = secs;
            }
        }
        if let Ok(threshold) = std::env::var("MONGOBRIDGE_FAILED_HEALTH_CHECK_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.failed_health_check_threshold = n;
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Backend credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub username: String,
    pub password: String,
    /// Empty, MONGODB-CR, MONGO-CR or MONGODB-X509.
    pub mechanism: String,
    /// Database used to establish credentials.
    pub source: String,
}

impl CredentialSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("MONGOBRIDGE_USERNAME") {
            self.username = user;
        }
        if let Ok(pass) = std::env::var("MONGOBRIDGE_PASSWORD") {
            self.password = pass;
        }
        if let Ok(mechanism) = std::env::var("MONGOBRIDGE_MECHANISM") {
            self.mechanism = mechanism;
        }
    }

    pub fn credential(&self) -> Credential {
        Credential {
            username: self.username.clone(),
            password: self.password.clone(),
            mechanism: self.mechanism.clone(),
            source: self.source.clone(),
        }
    }
}

/// Listener-side TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerTlsSettings {
    pub enabled: bool,
    /// PEM-encoded server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM-encoded private key.
    pub key_path: Option<PathBuf>,
}

/// Backend-side TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTlsSettings {
    pub enabled: bool,
    /// PEM-encoded CA certificate(s); system roots when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM-encoded client certificate, for X.509 auth.
    pub client_cert_path: Option<PathBuf>,
    /// PEM-encoded client private key.
    pub client_key_path: Option<PathBuf>,
    /// Skip certificate verification.
    pub insecure: bool,
    /// SNI override; the host part of the member address otherwise.
    pub server_name: Option<String>,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub listener: ListenerTlsSettings,
    pub backend: BackendTlsSettings,
}

impl TlsSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.enabled {
            if self.listener.cert_path.is_none() {
                return Err(ConfigError::Validation(
                    "listener TLS enabled but cert_path not set".to_string(),
                ));
            }
            if self.listener.key_path.is_none() {
                return Err(ConfigError::Validation(
                    "listener TLS enabled but key_path not set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "127.0.0.1:9216".parse().unwrap(),
        }
    }
}

impl MetricsSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("MONGOBRIDGE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("MONGOBRIDGE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Query handling flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Log every parsed query.
    pub log_queries: bool,
    /// Parse and intercept all queries, not just `$cmd` ones.
    pub proxy_all_queries: bool,
    /// Reject writes with a synthesized getLastError.
    pub read_only: bool,
}

impl QuerySettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MONGOBRIDGE_LOG_QUERIES") {
            self.log_queries = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("MONGOBRIDGE_PROXY_ALL") {
            self.proxy_all_queries = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("MONGOBRIDGE_READ_ONLY") {
            self.read_only = v == "1" || v.to_lowercase() == "true";
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, String),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::Parse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Validation(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.port_start, 6000);
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.topology.health_check_probe_ports, 5);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.listen_addr, config.network.listen_addr);
        assert_eq!(parsed.client.message_timeout_secs, 120);
    }

    #[test]
    fn test_rejects_zero_max_connections() {
        let mut config = Config::default();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_per_client() {
        let mut config = Config::default();
        config.client.max_per_client_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_seeds() {
        let mut config = Config::default();
        config.topology.seed_addrs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let mut config = Config::default();
        config.network.port_start = 7000;
        config.network.port_end = 6000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_mechanism() {
        let mut config = Config::default();
        config.credentials.username = "u".into();
        config.credentials.mechanism = "GSSAPI".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_x509_without_username_needs_client_cert() {
        let mut config = Config::default();
        config.credentials.mechanism = crate::auth::MECHANISM_X509.into();
        assert!(config.validate().is_err());

        // With a client certificate configured the username can be derived
        // from its subject.
        config.tls.backend.client_cert_path = Some("/client.pem".into());
        assert!(config.validate().is_ok());

        // An explicit username also works on its own.
        config.tls.backend.client_cert_path = None;
        config.credentials.username = "CN=app".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listener_tls_requires_paths() {
        let mut config = Config::default();
        config.tls.listener.enabled = true;
        assert!(config.validate().is_err());
        config.tls.listener.cert_path = Some("/cert.pem".into());
        config.tls.listener.key_path = Some("/key.pem".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        let proxy = config.client.proxy_config();
        assert_eq!(proxy.message_timeout, Duration::from_secs(120));
        assert_eq!(proxy.get_last_error_timeout, Duration::from_secs(60));
        let pool = config.pool.pool_config();
        assert_eq!(pool.idle_timeout, Duration::from_secs(3600));
    }
}
