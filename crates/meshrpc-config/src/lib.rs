// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-service client configuration for the meshrpc client connection
//! manager.
//!
//! [`ClientConfig`] is the unit of configuration a [`ServiceKey`] maps to.
//! [`ClientManagerConfig`] is the top-level bag an embedding application
//! hands the manager at startup — producing one from layered file/env/flag
//! sources is out of scope here; we only validate the already-merged value.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use meshrpc_duration::duration_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The logical, caller-facing name of a remote service (e.g. `"auth-app"`).
///
/// Newtype over `String` so it can key a `BTreeMap` or `HashMap`
/// interchangeably and cannot be confused with a discovery service name or a
/// raw `host:port` target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(String);

impl ServiceKey {
    /// Wrap a caller-facing name as a `ServiceKey`.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the underlying name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServiceKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// How a [`ServiceKey`]'s target is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Dial a literal `host:port` target directly, no discovery backend.
    Direct,
    /// Resolve instances through the etcd-backed discovery backend.
    Etcd,
}

/// Load-balancing policy used to pick one instance out of a discovered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalance {
    /// Always the first healthy instance in the returned order.
    #[default]
    First,
    /// Rotate through healthy instances with a shared cursor.
    RoundRobin,
    /// Uniformly random healthy instance.
    Random,
    /// Random instance weighted by `ServiceInstance::weight`.
    Weighted,
}

/// Errors raised while validating a [`ClientConfig`] or
/// [`ClientManagerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `direct` mode was selected (explicitly or by inference) but `target`
    /// is empty.
    #[error("service '{service_key}': direct mode requires a non-empty target")]
    MissingTarget {
        /// The service key whose config failed validation.
        service_key: String,
    },

    /// `etcd` mode was selected (explicitly or by inference) but
    /// `service_name` is empty.
    #[error("service '{service_key}': etcd mode requires a non-empty service_name")]
    MissingServiceName {
        /// The service key whose config failed validation.
        service_key: String,
    },

    /// Neither `target` nor `service_name` is known for this key.
    #[error("service '{service_key}' is not configured")]
    NotConfigured {
        /// The service key that was requested but has no config entry.
        service_key: String,
    },
}

/// Advisory-level issues that do not prevent operation but deserve
/// attention — surfaced alongside validation, never returned as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `timeout` is unusually large and may mask a hung dependency.
    LargeTimeout {
        /// Service the warning applies to.
        service_key: String,
        /// Configured timeout, in seconds.
        secs: u64,
    },
    /// A `weighted` load-balance policy was selected but every discovered
    /// instance reports the same weight, making it equivalent to `random`.
    ///
    /// Unlike [`ConfigWarning::LargeTimeout`], this can't be produced from a
    /// `ClientConfig` alone — it needs the discovered instance set, so it's
    /// emitted by `meshrpc-selector`'s `Selector::weight_warning` once
    /// instances are resolved, not by [`ClientConfig::warnings`].
    UniformWeights {
        /// Service the warning applies to.
        service_key: String,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LargeTimeout { service_key, secs } => {
                write!(f, "service '{service_key}': timeout of {secs}s is unusually large")
            }
            Self::UniformWeights { service_key } => {
                write!(
                    f,
                    "service '{service_key}': weighted load-balance with uniform instance weights"
                )
            }
        }
    }
}

/// Per-service client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Literal `host:port` target for direct mode.
    #[serde(default)]
    pub target: Option<String>,
    /// Discovery mode. `None` means "infer from `target`/`service_name`".
    #[serde(default)]
    pub discovery_mode: Option<DiscoveryMode>,
    /// Discovery key used when resolving through the discovery backend.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Load-balancing policy applied to the discovered instance set.
    #[serde(default)]
    pub load_balance: LoadBalance,
    /// Per-call deadline. `<= 0` (after deserialization, zero) is treated as
    /// "use the default" by [`ClientConfig::effective_timeout`].
    #[serde(default, with = "duration_millis")]
    pub timeout: Duration,
    /// Tri-state logging toggle; unset means "enabled".
    #[serde(default)]
    pub log_enabled: Option<bool>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: None,
            discovery_mode: None,
            service_name: None,
            load_balance: LoadBalance::default(),
            timeout: Duration::ZERO,
            log_enabled: None,
        }
    }
}

impl ClientConfig {
    /// Construct a direct-mode config dialing `target` literally.
    pub fn direct(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            discovery_mode: Some(DiscoveryMode::Direct),
            ..Self::default()
        }
    }

    /// Construct a discovery-mode config resolving `service_name` through
    /// etcd.
    pub fn discovered(service_name: impl Into<String>) -> Self {
        Self {
            service_name: Some(service_name.into()),
            discovery_mode: Some(DiscoveryMode::Etcd),
            ..Self::default()
        }
    }

    /// Resolve `discovery_mode`, inferring it from `target`/`service_name`
    /// when unset: both empty defaults to `Direct`.
    #[must_use]
    pub fn resolved_mode(&self) -> DiscoveryMode {
        if let Some(mode) = self.discovery_mode {
            return mode;
        }
        match (&self.target, &self.service_name) {
            (None, Some(name)) if !name.is_empty() => DiscoveryMode::Etcd,
            _ => DiscoveryMode::Direct,
        }
    }

    /// The timeout to actually use: `timeout` if positive, else the default
    /// of 5 seconds.
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Whether call logging is enabled for this service (default: true).
    #[must_use]
    pub fn logging_enabled(&self) -> bool {
        self.log_enabled.unwrap_or(true)
    }

    /// Validate this config in isolation, given the `ServiceKey` it belongs
    /// to (used only to label the error).
    pub fn validate(&self, service_key: &ServiceKey) -> Result<(), ConfigError> {
        match self.resolved_mode() {
            DiscoveryMode::Direct => {
                if self.target.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::MissingTarget {
                        service_key: service_key.to_string(),
                    });
                }
            }
            DiscoveryMode::Etcd => {
                if self.service_name.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::MissingServiceName {
                        service_key: service_key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Advisory warnings for this config that don't block validation.
    #[must_use]
    pub fn warnings(&self, service_key: &ServiceKey) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.effective_timeout() > Duration::from_secs(60) {
            warnings.push(ConfigWarning::LargeTimeout {
                service_key: service_key.to_string(),
                secs: self.effective_timeout().as_secs(),
            });
        }
        warnings
    }
}

/// Top-level configuration bag an embedding application hands the client
/// manager at startup.
///
/// The manager's documented inputs are per-service `ClientConfig` values
/// plus a couple of manager-wide knobs, so this struct is the concrete,
/// `serde`-deserializable shape that carries them in from whatever
/// file/env/flag layering the embedding application already does —
/// producing it from those layers is explicitly out of scope here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientManagerConfig {
    /// Per-service configuration, keyed by the caller-facing `ServiceKey`.
    #[serde(default)]
    pub per_service: BTreeMap<ServiceKey, ClientConfig>,
    /// Timeout applied when no per-service `timeout` is configured and a
    /// call's `ClientConfig::timeout` is zero. Defaults to 5 seconds.
    #[serde(default, with = "meshrpc_duration::option_duration_millis")]
    pub default_timeout: Option<Duration>,
    /// Deadline for the manager's boot-time pre-connect pass across all
    /// configured services.
    #[serde(default, with = "meshrpc_duration::option_duration_millis")]
    pub boot_timeout: Option<Duration>,
}

impl ClientManagerConfig {
    /// Validate every per-service config, collecting every failure rather
    /// than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let errors: Vec<ConfigError> = self
            .per_service
            .iter()
            .filter_map(|(key, cfg)| cfg.validate(key).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Collect advisory warnings across every configured service.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        self.per_service
            .iter()
            .flat_map(|(key, cfg)| cfg.warnings(key))
            .collect()
    }

    /// Look up a service's config, or [`ConfigError::NotConfigured`].
    pub fn get(&self, key: &ServiceKey) -> Result<&ClientConfig, ConfigError> {
        self.per_service
            .get(key)
            .ok_or_else(|| ConfigError::NotConfigured {
                service_key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_mode_requires_target() {
        let key = ServiceKey::new("auth-app");
        let cfg = ClientConfig {
            discovery_mode: Some(DiscoveryMode::Direct),
            ..ClientConfig::default()
        };
        assert_eq!(
            cfg.validate(&key),
            Err(ConfigError::MissingTarget {
                service_key: "auth-app".into()
            })
        );
    }

    #[test]
    fn etcd_mode_requires_service_name() {
        let key = ServiceKey::new("auth-app");
        let cfg = ClientConfig {
            discovery_mode: Some(DiscoveryMode::Etcd),
            ..ClientConfig::default()
        };
        assert_eq!(
            cfg.validate(&key),
            Err(ConfigError::MissingServiceName {
                service_key: "auth-app".into()
            })
        );
    }

    #[test]
    fn mode_inference_prefers_target_then_service_name() {
        let direct = ClientConfig {
            target: Some("127.0.0.1:9000".into()),
            ..ClientConfig::default()
        };
        assert_eq!(direct.resolved_mode(), DiscoveryMode::Direct);

        let discovered = ClientConfig {
            service_name: Some("auth-app".into()),
            ..ClientConfig::default()
        };
        assert_eq!(discovered.resolved_mode(), DiscoveryMode::Etcd);

        let both_empty = ClientConfig::default();
        assert_eq!(both_empty.resolved_mode(), DiscoveryMode::Direct);
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let cfg = ClientConfig::direct("127.0.0.1:9000");
        assert_eq!(cfg.effective_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn log_enabled_defaults_to_true() {
        let cfg = ClientConfig::direct("127.0.0.1:9000");
        assert!(cfg.logging_enabled());
    }

    #[test]
    fn manager_config_collects_all_validation_errors() {
        let mut per_service = BTreeMap::new();
        per_service.insert(
            ServiceKey::new("a"),
            ClientConfig {
                discovery_mode: Some(DiscoveryMode::Direct),
                ..ClientConfig::default()
            },
        );
        per_service.insert(
            ServiceKey::new("b"),
            ClientConfig {
                discovery_mode: Some(DiscoveryMode::Etcd),
                ..ClientConfig::default()
            },
        );
        let manager_cfg = ClientManagerConfig {
            per_service,
            ..ClientManagerConfig::default()
        };
        let errors = manager_cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn large_timeout_is_only_a_warning() {
        let key = ServiceKey::new("auth-app");
        let cfg = ClientConfig {
            target: Some("127.0.0.1:9000".into()),
            timeout: Duration::from_secs(120),
            ..ClientConfig::default()
        };
        assert!(cfg.validate(&key).is_ok());
        assert_eq!(
            cfg.warnings(&key),
            vec![ConfigWarning::LargeTimeout {
                service_key: "auth-app".into(),
                secs: 120
            }]
        );
    }

    #[test]
    fn not_configured_lookup_fails() {
        let manager_cfg = ClientManagerConfig::default();
        let err = manager_cfg.get(&ServiceKey::new("auth-app")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotConfigured {
                service_key: "auth-app".into()
            }
        );
    }
}
