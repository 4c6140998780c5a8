// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy for the meshrpc client connection manager.
//!
//! Every failure the core can produce is one variant of [`ClientError`] — a
//! flat, closed set rather than a generic code+context bag, so retry
//! conditions can match on it directly. [`HasStatusCode`] and [`HasRpcCode`]
//! are the small capability interfaces `OnHTTPStatus`/`OnCodes` retry
//! conditions dispatch through.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::time::Duration;

/// Stable, machine-matchable tag for an error's taxonomy row.
///
/// Exists alongside [`ClientError`] so callers (and retry conditions) can
/// classify an error without destructuring every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller asked for an unknown service key.
    NotConfigured,
    /// Upstream discovery query errored.
    DiscoveryFailed,
    /// Discovery returned no healthy endpoints.
    NoHealthyInstance,
    /// Transport handshake timed out or was refused.
    DialFailed,
    /// Limiter denied the call.
    RateLimited,
    /// Breaker rejected the call.
    BreakerOpen,
    /// Ctx deadline/timeout fired.
    DeadlineExceeded,
    /// Retry engine denied further retries.
    RetryBudgetExhausted,
    /// Any other RPC failure.
    Transport,
}

/// gRPC-style status code, carried by [`ClientError::Transport`] when the
/// underlying transport reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RpcCode {
    /// The operation completed successfully (rarely seen on an error path).
    Ok,
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// Client specified an invalid argument.
    InvalidArgument,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded,
    /// Requested entity was not found.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Caller lacks permission.
    PermissionDenied,
    /// A resource (quota, rate limit) has been exhausted.
    ResourceExhausted,
    /// System is not in a state required for the operation.
    FailedPrecondition,
    /// Operation was aborted.
    Aborted,
    /// Operand was out of range.
    OutOfRange,
    /// Operation is not implemented or not supported.
    Unimplemented,
    /// Internal invariant was violated.
    Internal,
    /// Service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
    /// Request lacks valid authentication credentials.
    Unauthenticated,
}

/// Capability interface: `{ Error(); StatusCode() }`, for `OnHTTPStatus`
/// conditions.
pub trait HasStatusCode {
    /// Return the HTTP status code associated with this error, if any.
    fn status_code(&self) -> Option<u16>;
}

/// Capability interface for `OnCodes` conditions — extracts the RPC status
/// code from an error, if one is attached.
pub trait HasRpcCode {
    /// Return the RPC status code associated with this error, if any.
    fn rpc_code(&self) -> Option<RpcCode>;
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error taxonomy for the client connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Caller asked for an unknown service key.
    #[error("service key '{service_key}' is not configured")]
    NotConfigured {
        /// The unconfigured service key.
        service_key: String,
    },

    /// Upstream discovery query errored.
    #[error("discovery query for '{service_name}' failed")]
    DiscoveryFailed {
        /// Discovery key that was queried.
        service_name: String,
        /// Underlying cause from the discovery backend.
        #[source]
        source: BoxError,
    },

    /// Discovery returned no healthy endpoints.
    #[error("no healthy instance available for '{service_name}'")]
    NoHealthyInstance {
        /// Discovery key that produced an empty/unhealthy set.
        service_name: String,
    },

    /// Transport handshake timed out or was refused.
    #[error("failed to dial {target}")]
    DialFailed {
        /// Target that failed to dial.
        target: String,
        /// Underlying transport cause.
        #[source]
        source: BoxError,
    },

    /// Limiter denied the call.
    #[error("rate limit exceeded for resource '{resource}'")]
    RateLimited {
        /// The limiter resource key (`"{service_key}:{method}"`).
        resource: String,
    },

    /// Breaker rejected the call.
    #[error("circuit breaker open for '{resource}'")]
    BreakerOpen {
        /// The breaker resource key (the service key).
        resource: String,
    },

    /// Ctx deadline/timeout fired.
    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Wall-clock time elapsed before the deadline fired.
        elapsed: Duration,
    },

    /// Retry engine denied further retries.
    #[error("retry budget exhausted")]
    RetryBudgetExhausted,

    /// Any other RPC failure.
    #[error("transport error")]
    Transport {
        /// RPC status code, if the transport reported one.
        code: Option<RpcCode>,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },
}

impl ClientError {
    /// Stable taxonomy tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured { .. } => ErrorKind::NotConfigured,
            Self::DiscoveryFailed { .. } => ErrorKind::DiscoveryFailed,
            Self::NoHealthyInstance { .. } => ErrorKind::NoHealthyInstance,
            Self::DialFailed { .. } => ErrorKind::DialFailed,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::RetryBudgetExhausted => ErrorKind::RetryBudgetExhausted,
            Self::Transport { .. } => ErrorKind::Transport,
        }
    }

    /// Build a [`ClientError::DiscoveryFailed`].
    pub fn discovery_failed(
        service_name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DiscoveryFailed {
            service_name: service_name.into(),
            source: Box::new(source),
        }
    }

    /// Build a [`ClientError::DialFailed`].
    pub fn dial_failed(
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DialFailed {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Build a [`ClientError::Transport`] with no known status code.
    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport {
            code: None,
            source: Box::new(source),
        }
    }

    /// Build a [`ClientError::Transport`] carrying an RPC status code.
    pub fn transport_with_code(
        code: RpcCode,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            code: Some(code),
            source: Box::new(source),
        }
    }
}

impl HasRpcCode for ClientError {
    fn rpc_code(&self) -> Option<RpcCode> {
        match self {
            Self::Transport { code, .. } => *code,
            Self::DeadlineExceeded { .. } => Some(RpcCode::DeadlineExceeded),
            Self::RateLimited { .. } => Some(RpcCode::ResourceExhausted),
            _ => None,
        }
    }
}

impl HasStatusCode for ClientError {
    fn status_code(&self) -> Option<u16> {
        // meshrpc is a gRPC-first client; an HTTP status only shows up when
        // a downstream HTTP-based transport source itself carries one.
        None
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotConfigured => "not_configured",
            Self::DiscoveryFailed => "discovery_failed",
            Self::NoHealthyInstance => "no_healthy_instance",
            Self::DialFailed => "dial_failed",
            Self::RateLimited => "rate_limited",
            Self::BreakerOpen => "breaker_open",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::Transport => "transport",
        };
        f.write_str(s)
    }
}
