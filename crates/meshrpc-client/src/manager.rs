// SPDX-License-Identifier: MIT OR Apache-2.0
//! [`ClientManager`]: owns the connection pool, the watch-loop lifecycles,
//! and the collaborator references every connection's interceptor chain is
//! composed from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use meshrpc_config::{ClientConfig, ClientManagerConfig, ConfigError, DiscoveryMode, ServiceKey};
use meshrpc_discovery::Discovery;
use meshrpc_error::ClientError;
use meshrpc_interceptor::{AlwaysAllowLimiter, Breaker, InterceptorChain, NoTracer, NoopBreaker, RateLimiter, TracerProvider};
use meshrpc_retry::CancellationToken;
use meshrpc_selector::Selector;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};

use crate::connection::{ConnectionEntry, MetricsHandler, NoopMetricsHandler};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of pool occupancy, for operational dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// Number of services with a `ClientConfig` entry.
    pub configured: usize,
    /// Number of services with a currently-live connection.
    pub connected: usize,
}

/// The client connection manager: one per application.
///
/// `configs` is immutable after construction, so it carries no lock;
/// `connections` is the one map that mutates post-construction and is
/// guarded by its own read-write lock — the two never need to be held
/// together, so there is no ordering to get wrong between them.
pub struct ClientManager {
    configs: HashMap<ServiceKey, ClientConfig>,
    default_timeout: Duration,
    default_boot_timeout: Duration,

    connections: tokio::sync::RwLock<HashMap<ServiceKey, Arc<ConnectionEntry>>>,
    dial_locks: Mutex<HashMap<ServiceKey, Arc<tokio::sync::Mutex<()>>>>,
    watch_handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,

    discovery: RwLock<Option<Arc<dyn Discovery>>>,
    breaker: RwLock<Option<Arc<dyn Breaker>>>,
    limiter: RwLock<Option<Arc<dyn RateLimiter>>>,
    tracer: RwLock<Option<Arc<dyn TracerProvider>>>,
    metrics: RwLock<Option<Arc<dyn MetricsHandler>>>,
    selector_override: RwLock<Option<Selector>>,
}

impl ClientManager {
    /// Build a manager from an already-merged configuration bag, validating
    /// every per-service entry up front.
    pub fn new(config: ClientManagerConfig) -> Result<Self, Vec<ConfigError>> {
        config.validate()?;
        Ok(Self {
            configs: config.per_service.into_iter().collect(),
            default_timeout: config.default_timeout.unwrap_or(DEFAULT_TIMEOUT),
            default_boot_timeout: config.boot_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT),
            connections: tokio::sync::RwLock::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            watch_handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            discovery: RwLock::new(None),
            breaker: RwLock::new(None),
            limiter: RwLock::new(None),
            tracer: RwLock::new(None),
            metrics: RwLock::new(None),
            selector_override: RwLock::new(None),
        })
    }

    // ── Injection ────────────────────────────────────────────────────
    // Intended to be called before `pre_connect`; no contract for dynamic
    // swap, so a plain lock-and-replace is sufficient.

    /// Inject the discovery backend used by every `etcd`-mode service.
    pub fn set_discovery(&self, discovery: Arc<dyn Discovery>) {
        *self.discovery.write().expect("discovery lock poisoned") = Some(discovery);
    }

    /// Inject the circuit breaker composed into every connection's chain.
    pub fn set_breaker(&self, breaker: Arc<dyn Breaker>) {
        *self.breaker.write().expect("breaker lock poisoned") = Some(breaker);
    }

    /// Inject the rate limiter composed into every connection's chain.
    pub fn set_limiter(&self, limiter: Arc<dyn RateLimiter>) {
        *self.limiter.write().expect("limiter lock poisoned") = Some(limiter);
    }

    /// Inject the tracer provider composed into every connection's chain.
    pub fn set_tracer_provider(&self, tracer: Arc<dyn TracerProvider>) {
        *self.tracer.write().expect("tracer lock poisoned") = Some(tracer);
    }

    /// Inject a metrics handler observing every completed call.
    pub fn set_metrics_handler(&self, metrics: Arc<dyn MetricsHandler>) {
        *self.metrics.write().expect("metrics lock poisoned") = Some(metrics);
    }

    /// Override the selector used for every discovery-mode service,
    /// regardless of its configured `load_balance` policy.
    pub fn set_selector(&self, selector: Selector) {
        *self.selector_override.write().expect("selector lock poisoned") = Some(selector);
    }

    // ── Public contract ──────────────────────────────────────────────

    /// Start every discovery-mode service's watch loop, then best-effort
    /// dial every configured service, returning once all dial attempts have
    /// terminated (succeeded or bounded-time failed). Partial failures are
    /// logged as warnings, not returned as an error — a missing connection
    /// is retried on the next [`ClientManager::get_conn`].
    ///
    /// `boot_timeout` bounds each service's dial attempt individually; pass
    /// `None` to use the manager's configured boot timeout (default 30s).
    pub async fn pre_connect(&self, boot_timeout: Option<Duration>) {
        let boot_timeout = boot_timeout.unwrap_or(self.default_boot_timeout);

        // Watch loops start first and never block on dialing.
        for (key, cfg) in &self.configs {
            if cfg.resolved_mode() != DiscoveryMode::Etcd {
                continue;
            }
            let Some(service_name) = cfg.service_name.clone().filter(|s| !s.is_empty()) else {
                continue;
            };
            let Some(discovery) = self.discovery() else {
                tracing::warn!(service_key = %key, "discovery mode configured but no discovery backend injected, skipping watch");
                continue;
            };
            let shutdown = self.shutdown.clone();
            let handle = tokio::spawn(crate::watch::run(discovery, service_name, shutdown));
            self.watch_handles.lock().expect("watch handles lock poisoned").push(handle);
        }

        let keys: Vec<ServiceKey> = self.configs.keys().cloned().collect();
        let dials = keys.into_iter().map(|key| async move {
            match tokio::time::timeout(boot_timeout, self.get_conn(&key)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(service_key = %key, error = %err, "pre-connect dial failed, will retry on demand");
                }
                Err(_) => {
                    tracing::warn!(service_key = %key, "pre-connect dial timed out, will retry on demand");
                }
            }
        });
        futures::future::join_all(dials).await;
    }

    /// Return the cached connection for `service_key`, dialing on demand if
    /// none exists yet. Fails fast with [`ClientError::NotConfigured`] for
    /// an unknown key.
    pub async fn get_conn(&self, service_key: &ServiceKey) -> Result<Arc<ConnectionEntry>, ClientError> {
        if let Some(conn) = self.connections.read().await.get(service_key) {
            return Ok(conn.clone());
        }

        let cfg = self
            .configs
            .get(service_key)
            .ok_or_else(|| ClientError::NotConfigured {
                service_key: service_key.to_string(),
            })?;

        // Per-key dial mutex: serializes concurrent dials for the same key
        // without blocking `get_conn` calls for unrelated keys, so the
        // number of concurrent dials in progress for one key is never > 1.
        let dial_lock = {
            let mut locks = self.dial_locks.lock().expect("dial locks poisoned");
            locks.entry(service_key.clone()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        let _permit = dial_lock.lock().await;

        // Double-checked: another caller may have dialed while we waited.
        if let Some(conn) = self.connections.read().await.get(service_key) {
            return Ok(conn.clone());
        }

        let target = self.resolve_target(service_key, cfg).await?;
        let entry = Arc::new(self.dial(service_key, cfg, target).await?);
        self.connections.write().await.insert(service_key.clone(), entry.clone());
        Ok(entry)
    }

    /// Cancel every watch loop, await their termination, then drop every
    /// pooled connection (closing the underlying transport).
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.watch_handles.lock().expect("watch handles lock poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
        self.connections.write().await.clear();
    }

    /// Snapshot of pool occupancy.
    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            configured: self.configs.len(),
            connected: self.connections.read().await.len(),
        }
    }

    /// Whether `service_key` currently has a live, cached connection.
    pub async fn is_connected(&self, service_key: &ServiceKey) -> bool {
        self.connections.read().await.contains_key(service_key)
    }

    // ── Connect pipeline ─────────────────────────────────────────────

    async fn resolve_target(&self, service_key: &ServiceKey, cfg: &ClientConfig) -> Result<String, ClientError> {
        match cfg.resolved_mode() {
            DiscoveryMode::Direct => Ok(cfg.target.clone().unwrap_or_default()),
            DiscoveryMode::Etcd => {
                let service_name = cfg.service_name.clone().unwrap_or_default();
                let discovery = self.discovery().ok_or_else(|| {
                    ClientError::discovery_failed(service_name.clone(), std::io::Error::other("no discovery backend injected"))
                })?;
                let instances = discovery
                    .discover(&service_name)
                    .await
                    .map_err(|err| ClientError::discovery_failed(service_name.clone(), err))?;
                let selector = self.resolve_selector(cfg);
                if let Some(warning) = selector.weight_warning(service_key.as_str(), &instances) {
                    tracing::warn!(service_key = %service_key, "{warning}");
                }
                selector
                    .select(&instances)
                    .map(|instance| instance.address)
                    .ok_or_else(|| ClientError::NoHealthyInstance { service_name })
            }
        }
    }

    async fn dial(&self, service_key: &ServiceKey, cfg: &ClientConfig, target: String) -> Result<ConnectionEntry, ClientError> {
        let timeout = self.effective_timeout(cfg);

        let endpoint = Endpoint::from_shared(format!("http://{target}"))
            .map_err(|err| ClientError::dial_failed(target.clone(), err))?
            .connect_timeout(timeout)
            .timeout(timeout);

        let channel: Channel = endpoint.connect().await.map_err(|err| ClientError::dial_failed(target.clone(), err))?;

        let interceptors = Arc::new(
            InterceptorChain::new()
                .with_breaker(self.breaker().unwrap_or_else(|| Arc::new(NoopBreaker)))
                .with_limiter(self.limiter().unwrap_or_else(|| Arc::new(AlwaysAllowLimiter)))
                .with_tracer(self.tracer().unwrap_or_else(|| Arc::new(NoTracer))),
        );
        let metrics = self.metrics().unwrap_or_else(|| Arc::new(NoopMetricsHandler));

        Ok(ConnectionEntry::new(
            channel,
            interceptors,
            metrics,
            service_key.as_str(),
            target,
            timeout,
            cfg.logging_enabled(),
        ))
    }

    fn effective_timeout(&self, cfg: &ClientConfig) -> Duration {
        if cfg.timeout.is_zero() {
            self.default_timeout
        } else {
            cfg.timeout
        }
    }

    fn resolve_selector(&self, cfg: &ClientConfig) -> Selector {
        self.selector_override
            .read()
            .expect("selector lock poisoned")
            .clone()
            .unwrap_or_else(|| Selector::new(cfg.load_balance))
    }

    fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.discovery.read().expect("discovery lock poisoned").clone()
    }

    fn breaker(&self) -> Option<Arc<dyn Breaker>> {
        self.breaker.read().expect("breaker lock poisoned").clone()
    }

    fn limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.limiter.read().expect("limiter lock poisoned").clone()
    }

    fn tracer(&self) -> Option<Arc<dyn TracerProvider>> {
        self.tracer.read().expect("tracer lock poisoned").clone()
    }

    fn metrics(&self) -> Option<Arc<dyn MetricsHandler>> {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }
}
