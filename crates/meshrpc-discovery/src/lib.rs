// SPDX-License-Identifier: MIT OR Apache-2.0
//! Service-discovery contract the client manager consumes.
//!
//! [`Discovery`] is the `Discover`/`Watch` capability interface treated as
//! an external collaborator — the embedded discovery backend itself is out
//! of scope, we only define what the core calls through. [`MockDiscovery`]
//! is the in-memory test double every trait family in this lineage ships
//! alongside its trait.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::fmt;
use tokio::sync::watch;

/// One discovered endpoint for a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    /// Discovery service name this instance belongs to.
    pub service: String,
    /// `host:port` address.
    pub address: String,
    /// Port, duplicated from `address` for callers that want it structured.
    pub port: u16,
    /// Relative weight used by the `weighted` selector.
    pub weight: u32,
    /// Whether this instance currently passes health checks.
    pub healthy: bool,
}

impl ServiceInstance {
    /// Build a healthy instance with the given weight.
    #[must_use]
    pub fn new(service: impl Into<String>, address: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            port,
            weight,
            healthy: true,
        }
    }

    /// Return a copy marked unhealthy.
    #[must_use]
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }
}

/// Errors a [`Discovery`] backend can report.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery query itself failed (backend unreachable, malformed
    /// response, etc).
    #[error("discovery query failed: {message}")]
    QueryFailed {
        /// Human-readable cause.
        message: String,
    },
    /// The requested service name has no registration in the discovery
    /// backend at all (distinct from "zero healthy instances").
    #[error("service '{service_name}' is not registered")]
    Unregistered {
        /// The service name that was queried.
        service_name: String,
    },
}

/// `Discover`/`Watch` capability interface the client manager consumes.
/// The embedded discovery backend's own implementation is out of scope for
/// this core.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolve the current instance set for `service_name`.
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// Subscribe to instance-set changes for `service_name`. The returned
    /// receiver's `changed()`/`borrow()` yields the full instance set on
    /// every update — a receive-only channel of the full instance list,
    /// not a diff.
    async fn watch(&self, service_name: &str) -> Result<watch::Receiver<Vec<ServiceInstance>>, DiscoveryError>;
}

impl fmt::Debug for dyn Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Discovery")
    }
}

/// In-memory [`Discovery`] test double, backed by one
/// `watch::Sender<Vec<ServiceInstance>>` per registered service name.
///
/// Used by `meshrpc-client`'s own test suite and exported for downstream
/// integration tests that want a discovery backend without a real etcd
/// dependency.
pub struct MockDiscovery {
    channels: std::sync::Mutex<std::collections::HashMap<String, watch::Sender<Vec<ServiceInstance>>>>,
}

impl Default for MockDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDiscovery {
    /// An empty mock with no registered services.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Register (or replace) the instance set for `service_name`, creating
    /// its watch channel if this is the first time it's seen.
    pub fn set_instances(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        let mut channels = self.channels.lock().expect("mock discovery lock poisoned");
        match channels.get(service_name) {
            Some(sender) => {
                let _ = sender.send(instances);
            }
            None => {
                let (sender, _receiver) = watch::channel(instances);
                channels.insert(service_name.to_string(), sender);
            }
        }
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let channels = self.channels.lock().expect("mock discovery lock poisoned");
        channels
            .get(service_name)
            .map(|sender| sender.borrow().clone())
            .ok_or_else(|| DiscoveryError::Unregistered {
                service_name: service_name.to_string(),
            })
    }

    async fn watch(&self, service_name: &str) -> Result<watch::Receiver<Vec<ServiceInstance>>, DiscoveryError> {
        let mut channels = self.channels.lock().expect("mock discovery lock poisoned");
        let sender = channels.entry(service_name.to_string()).or_insert_with(|| {
            let (sender, _receiver) = watch::channel(Vec::new());
            sender
        });
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discover_returns_registered_instances() {
        let mock = MockDiscovery::new();
        mock.set_instances("auth-app", vec![ServiceInstance::new("auth-app", "10.0.0.1:9000", 9000, 1)]);
        let instances = mock.discover("auth-app").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn discover_unregistered_service_errors() {
        let mock = MockDiscovery::new();
        let err = mock.discover("unknown").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Unregistered { .. }));
    }

    #[tokio::test]
    async fn watch_observes_subsequent_updates() {
        let mock = MockDiscovery::new();
        mock.set_instances("auth-app", vec![ServiceInstance::new("auth-app", "10.0.0.1:9000", 9000, 1)]);
        let mut receiver = mock.watch("auth-app").await.unwrap();
        assert_eq!(receiver.borrow().len(), 1);

        mock.set_instances("auth-app", vec![]);
        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().len(), 0);
    }
}
