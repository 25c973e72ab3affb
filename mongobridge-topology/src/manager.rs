//! The state manager.
//!
//! Owns the set of per-member proxies and the real↔proxy address maps,
//! refreshes the topology on demand, and is itself the proxy mapper the
//! response rewriters consult. The maps are guarded by a read/write lock;
//! network I/O never happens while it is held.

use crate::error::TopologyError;
use crate::state::{self, ReplicaSetState};
use mongobridge_proxy::{
    Backend, BackendTls, Config, Credential, ExtensionStack, Metrics, Pool, PoolConfig, Proxy,
    ProxyConfig, ProxyMapper, QueryProcessor,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Difference between two topology snapshots, by member name.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SetComparison {
    /// Members we proxy that are gone from the new state.
    pub extra_members: Vec<String>,
    /// Members in the new state we do not proxy yet.
    pub missing_members: Vec<String>,
}

#[derive(Default)]
struct ManagerInner {
    proxy_to_real: HashMap<String, String>,
    real_to_proxy: HashMap<String, String>,
    proxies: HashMap<String, Arc<Proxy>>,
    current: Option<ReplicaSetState>,
    base_addrs: Vec<String>,
}

/// Owns the proxy set and keeps it synchronized with the replica set.
pub struct StateManager {
    inner: RwLock<ManagerInner>,
    config: Config,
    proxy_config: Arc<ProxyConfig>,
    pool_config: PoolConfig,
    credential: Option<Credential>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    backend_tls: Option<Arc<BackendTls>>,
    health_tls: Option<Arc<BackendTls>>,
    processor: Arc<QueryProcessor>,
    extensions: Arc<ExtensionStack>,
    metrics: Option<Arc<Metrics>>,
}

/// The mapper handed to rewriters; a weak reference avoids a cycle with
/// the processor the manager owns.
struct ManagerMapper(Weak<StateManager>);

impl ProxyMapper for ManagerMapper {
    fn proxy(&self, real: &str) -> Option<String> {
        let manager = self.0.upgrade()?;
        let inner = manager.inner.read();
        inner.real_to_proxy.get(real).cloned()
    }
}

impl StateManager {
    pub fn new(
        config: Config,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
        backend_tls: Option<Arc<BackendTls>>,
        health_tls: Option<Arc<BackendTls>>,
        extensions: Arc<ExtensionStack>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StateManager>| {
            let processor = Arc::new(QueryProcessor::new(
                Arc::new(ManagerMapper(weak.clone())),
                config.query.read_only,
                config.query.proxy_all_queries,
                extensions.clone(),
                metrics.clone(),
            ));
            let credential = Some(config.credentials.credential()).filter(|c| c.is_configured());
            Self {
                inner: RwLock::new(ManagerInner {
                    base_addrs: config.topology.seed_addrs.clone(),
                    ..Default::default()
                }),
                proxy_config: Arc::new(config.client.proxy_config()),
                pool_config: config.pool.pool_config(),
                credential,
                tls_acceptor,
                backend_tls,
                health_tls,
                processor,
                extensions,
                metrics,
                config,
            }
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discovers the initial topology and starts one proxy per healthy
    /// member.
    pub async fn start(self: &Arc<Self>) -> Result<(), TopologyError> {
        tracing::info!("starting state manager");
        let state = self.generate_state().await?;
        let healthy = state.addrs();
        if healthy.is_empty() {
            return Err(TopologyError::NoHealthyMembers(
                self.config.topology.seed_addrs.join(","),
            ));
        }

        let mut proxies = Vec::with_capacity(healthy.len());
        for addr in &healthy {
            proxies.push(self.create_proxy(addr).await?);
        }

        {
            let mut inner = self.inner.write();
            for proxy in &proxies {
                Self::add_proxy(&mut inner, proxy.clone())?;
            }
            Self::merge_base_addrs(&mut inner, &state);
            inner.current = Some(state);
        }

        for proxy in &proxies {
            proxy.start();
        }
        Ok(())
    }

    /// Runs `synchronize` whenever the trigger channel fires.
    pub async fn keep_synchronized(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        while trigger.recv().await.is_some() {
            self.synchronize().await;
        }
    }

    /// Refreshes the topology and adds/removes proxies to match.
    ///
    /// Transient failures leave the current proxies untouched.
    pub async fn synchronize(self: &Arc<Self>) {
        let new_state = match self.generate_state().await {
            Ok(state) => state,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.sync_failures_total.inc();
                }
                tracing::warn!("topology refresh failed, all nodes possibly down?: {}", e);
                return;
            }
        };

        let comparison = {
            let inner = self.inner.read();
            let old_members: Vec<String> = inner
                .current
                .as_ref()
                .map(|s| s.status.members.iter().map(|m| m.name.clone()).collect())
                .unwrap_or_default();
            let new_members: Vec<String> = new_state
                .status
                .members
                .iter()
                .map(|m| m.name.clone())
                .collect();
            match Self::compare(&inner, &old_members, &new_members) {
                Ok(c) => c,
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.sync_failures_total.inc();
                    }
                    tracing::warn!("topology comparison failed: {}", e);
                    return;
                }
            }
        };

        // Listeners and proxies are built without holding the lock.
        let mut added = Vec::with_capacity(comparison.missing_members.len());
        for name in &comparison.missing_members {
            match self.create_proxy(name).await {
                Ok(proxy) => added.push(proxy),
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.sync_failures_total.inc();
                    }
                    tracing::error!("failed to create proxy for {}: {}", name, e);
                    return;
                }
            }
        }

        let removed = {
            let mut inner = self.inner.write();
            let mut removed = Vec::with_capacity(comparison.extra_members.len());
            for name in &comparison.extra_members {
                if let Some(proxy) = Self::remove_proxy_by_member(&mut inner, name) {
                    removed.push(proxy);
                }
            }
            for proxy in &added {
                if let Err(e) = Self::add_proxy(&mut inner, proxy.clone()) {
                    tracing::error!("failed to register proxy: {}", e);
                }
            }
            Self::merge_base_addrs(&mut inner, &new_state);
            inner.current = Some(new_state);
            removed
        };

        for proxy in removed {
            tokio::spawn(async move {
                proxy.stop(true).await;
            });
        }
        for proxy in added {
            proxy.start();
        }
    }

    /// Proxy addresses currently serving, i.e. the addresses clients may
    /// see in rewritten replies.
    pub fn proxy_members(&self) -> Vec<String> {
        self.inner.read().proxy_to_real.keys().cloned().collect()
    }

    /// Looks up the proxy address fronting a real member address.
    pub fn proxy_addr(&self, real: &str) -> Result<String, TopologyError> {
        self.inner
            .read()
            .real_to_proxy
            .get(real)
            .cloned()
            .ok_or_else(|| TopologyError::NotInReplicaSet(real.to_string()))
    }

    /// Stops every proxy. Used at process shutdown.
    pub async fn stop_all(&self, hard: bool) {
        let proxies: Vec<Arc<Proxy>> = {
            let mut inner = self.inner.write();
            inner.proxy_to_real.clear();
            inner.real_to_proxy.clear();
            inner.proxies.drain().map(|(_, p)| p).collect()
        };
        for proxy in proxies {
            proxy.stop(hard).await;
        }
    }

    async fn generate_state(&self) -> Result<ReplicaSetState, TopologyError> {
        let addrs = self.inner.read().base_addrs.clone();
        state::from_addrs(
            &addrs,
            &self.config.topology.replica_set_name,
            self.credential.as_ref(),
            self.backend_tls.as_deref(),
        )
        .await
    }

    /// Computes which proxied members disappeared and which members are
    /// new. A member without a proxy counts as missing even if the old
    /// state listed it.
    fn compare(
        inner: &ManagerInner,
        old_members: &[String],
        new_members: &[String],
    ) -> Result<SetComparison, TopologyError> {
        if old_members.is_empty() && new_members.is_empty() {
            return Err(TopologyError::NoMembers);
        }

        let mut extra: HashSet<&String> = old_members
            .iter()
            .filter(|name| inner.real_to_proxy.contains_key(*name))
            .collect();

        let mut comparison = SetComparison::default();
        for name in new_members {
            if !extra.remove(name) {
                comparison.missing_members.push(name.clone());
            }
        }
        comparison.extra_members = extra.into_iter().cloned().collect();
        comparison.extra_members.sort_unstable();
        comparison.missing_members.sort_unstable();
        Ok(comparison)
    }

    async fn create_proxy(&self, mongo_addr: &str) -> Result<Arc<Proxy>, TopologyError> {
        let listener = allocate_listener(
            &self.config.network.listen_addr,
            self.config.network.port_start,
            self.config.network.port_end,
        )
        .await?;

        let mut backend = Backend::new(mongo_addr);
        backend.tls = self.backend_tls.clone();
        backend.credential = self.credential.clone();
        backend.metrics = self.metrics.clone();
        let pool = Pool::new(backend, self.pool_config.clone());

        let proxy = Proxy::new(
            listener,
            mongo_addr.to_string(),
            pool,
            self.processor.clone(),
            self.proxy_config.clone(),
            self.tls_acceptor.clone(),
            self.extensions.clone(),
            self.metrics.clone(),
        )?;
        Ok(Arc::new(proxy))
    }

    fn add_proxy(inner: &mut ManagerInner, proxy: Arc<Proxy>) -> Result<(), TopologyError> {
        let proxy_addr = proxy.proxy_addr().to_string();
        let mongo_addr = proxy.mongo_addr().to_string();
        if inner.proxy_to_real.contains_key(&proxy_addr) {
            return Err(TopologyError::DuplicateProxy(proxy_addr));
        }
        if inner.real_to_proxy.contains_key(&mongo_addr) {
            return Err(TopologyError::DuplicateMongo(mongo_addr));
        }
        tracing::info!("added {}", proxy);
        inner.proxy_to_real.insert(proxy_addr.clone(), mongo_addr.clone());
        inner.real_to_proxy.insert(mongo_addr, proxy_addr.clone());
        inner.proxies.insert(proxy_addr, proxy);
        Ok(())
    }

    fn remove_proxy_by_member(inner: &mut ManagerInner, mongo_addr: &str) -> Option<Arc<Proxy>> {
        let proxy_addr = inner.real_to_proxy.remove(mongo_addr)?;
        inner.proxy_to_real.remove(&proxy_addr);
        let proxy = inner.proxies.remove(&proxy_addr);
        if let Some(proxy) = &proxy {
            tracing::info!("removed {}", proxy);
        }
        proxy
    }

    /// Unions discovered member addresses into the seed list so later
    /// synchronizations keep working as original seeds die.
    fn merge_base_addrs(inner: &mut ManagerInner, state: &ReplicaSetState) {
        for addr in state.addrs() {
            if !inner.base_addrs.contains(&addr) {
                inner.base_addrs.push(addr);
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::health::Checkable for StateManager {
    /// Connects through the probable localhost proxy ports and runs
    /// `replSetGetStatus`, the way a client would.
    async fn check(&self, timeout: Duration) -> Result<(), TopologyError> {
        let start = self.config.network.port_start;
        let probes = self.config.topology.health_check_probe_ports;
        let addrs: Vec<String> = (0..probes)
            .map(|i| format!("127.0.0.1:{}", start.saturating_add(i)))
            .collect();

        let result = tokio::time::timeout(
            timeout,
            crate::health::check_repl_set_status(
                &addrs,
                &self.config.topology.replica_set_name,
                self.health_tls.as_deref(),
            ),
        )
        .await
        .map_err(|_| TopologyError::Timeout)?;

        if result.is_err() {
            if let Some(m) = &self.metrics {
                m.healthcheck_failures_total.inc();
            }
        }
        result
    }

    /// Crashes the process so a supervisor restarts it.
    fn handle_failure(&self) {
        tracing::error!("crashing after consecutive failed health checks");
        panic!("failed health checks");
    }
}

/// Binds a listener on the first free port in `[start, end]`.
pub async fn allocate_listener(
    listen_addr: &str,
    start: u16,
    end: u16,
) -> Result<TcpListener, TopologyError> {
    for port in start..=end {
        if let Ok(listener) = TcpListener::bind((listen_addr, port)).await {
            return Ok(listener);
        }
    }
    Err(TopologyError::NoFreePort { start, end })
}
