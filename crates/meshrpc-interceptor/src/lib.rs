// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fixed five-layer interceptor chain every outbound call passes
//! through: Trace → RateLimit → Breaker → Timeout → Log.
//!
//! The set and ordering of layers is closed rather than an extensible
//! pipeline callers push arbitrary middleware onto: this is a single
//! [`InterceptorChain::call`] that nests the five effects in order, each
//! layer wrapping the *future* of everything beneath it rather than
//! transforming a value walked through a flat loop. [`Breaker`],
//! [`RateLimiter`] and [`TracerProvider`] are the three collaborators
//! treated as externally supplied, object-safe cross-cutting concerns; each
//! ships a no-op default so a connection with nothing injected still
//! behaves correctly.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrpc_error::ClientError;

/// Failure domain for a [`RateLimiter`] collaborator, kept separate from
/// [`ClientError`] because a limiter's internal failure never propagates to
/// the caller — it is logged and the call proceeds.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// The limiter backend itself failed to answer the allow/deny question.
    #[error("rate limiter backend error: {message}")]
    Backend {
        /// Human-readable cause.
        message: String,
    },
}

/// Circuit-breaker collaborator, consulted around the transport call.
/// Split into a before/after pair rather than a single generic
/// `execute(op)` so the trait stays object-safe behind
/// `Arc<dyn Breaker>` — an `execute<T>` generic over the wrapped call's
/// output type cannot appear in a trait object's vtable.
#[async_trait]
pub trait Breaker: Send + Sync {
    /// Ask whether a call against `resource` may proceed. An `Err` here
    /// short-circuits the chain before the transport is ever invoked.
    async fn before_call(&self, resource: &str) -> Result<(), ClientError>;

    /// Report whether the call that `before_call` admitted ultimately
    /// succeeded, so the breaker can update its internal state.
    async fn record_result(&self, resource: &str, success: bool);
}

/// Rate-limiter collaborator, consulted before the breaker.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether this limiter is active. A disabled limiter is skipped
    /// entirely rather than asked to `allow`.
    fn is_enabled(&self) -> bool;

    /// Ask whether a call against `resource` may proceed right now.
    async fn allow(&self, resource: &str) -> Result<bool, LimiterError>;
}

/// Trace-context source consulted by the Trace layer: the active
/// OpenTelemetry span's trace-id, when one is open. Distributed tracing
/// export itself is out of scope; this crate only reads the id.
pub trait TracerProvider: Send + Sync {
    /// The current span's trace-id, if a span is active.
    fn current_span_trace_id(&self) -> Option<String>;
}

/// [`Breaker`] that never rejects a call; used when no breaker is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBreaker;

#[async_trait]
impl Breaker for NoopBreaker {
    async fn before_call(&self, _resource: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn record_result(&self, _resource: &str, _success: bool) {}
}

/// [`RateLimiter`] that is always disabled; used when no limiter is
/// injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAllowLimiter;

#[async_trait]
impl RateLimiter for AlwaysAllowLimiter {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn allow(&self, _resource: &str) -> Result<bool, LimiterError> {
        Ok(true)
    }
}

/// [`TracerProvider`] with no active span; used when no tracer is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTracer;

impl TracerProvider for NoTracer {
    fn current_span_trace_id(&self) -> Option<String> {
        None
    }
}

/// Per-call state threaded through the chain. `metadata` carries the
/// outbound headers the Trace layer injects `x-trace-id` into; everything
/// else configures the Timeout and Log layers.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The configured service key the call targets.
    pub service_key: String,
    /// The RPC method name, used to label rate-limiter/log resource keys.
    pub method: String,
    /// The resolved transport target (`host:port`), for log lines.
    pub target: String,
    /// Outbound metadata map; the Trace layer inserts [`TRACE_ID_HEADER`]
    /// here without overwriting an existing value under that key.
    pub metadata: BTreeMap<String, String>,
    /// Caller-supplied trace-id, used when no OTel span is active.
    pub custom_trace_id: Option<String>,
    /// Per-call timeout applied when the caller has not already set a
    /// deadline.
    pub timeout: Duration,
    /// Whether the caller already carries a deadline (e.g. from a retry
    /// context) the Timeout layer should defer to instead of deriving its
    /// own.
    pub has_caller_deadline: bool,
    /// Whether the Log layer should emit anything at all for this call.
    pub log_enabled: bool,
}

impl CallContext {
    /// Build a context with the library defaults: no existing metadata, no
    /// caller deadline, logging on.
    #[must_use]
    pub fn new(service_key: impl Into<String>, method: impl Into<String>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service_key: service_key.into(),
            method: method.into(),
            target: target.into(),
            metadata: BTreeMap::new(),
            custom_trace_id: None,
            timeout,
            has_caller_deadline: false,
            log_enabled: true,
        }
    }
}

/// The composed five-layer chain, built once per connection at dial time
/// and reused for every call against it.
pub struct InterceptorChain {
    breaker: Arc<dyn Breaker>,
    limiter: Arc<dyn RateLimiter>,
    tracer: Arc<dyn TracerProvider>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self {
            breaker: Arc::new(NoopBreaker),
            limiter: Arc::new(AlwaysAllowLimiter),
            tracer: Arc::new(NoTracer),
        }
    }
}

impl InterceptorChain {
    /// Build a chain with no collaborators injected — every layer still
    /// runs, but Breaker/RateLimit/Trace are all no-ops.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a circuit breaker, replacing [`NoopBreaker`].
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<dyn Breaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Inject a rate limiter, replacing [`AlwaysAllowLimiter`].
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Inject a tracer provider, replacing [`NoTracer`].
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn TracerProvider>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Run `inner` through the five layers in order. `inner` receives the
    /// context after the Trace layer has injected its metadata, and its
    /// `Ok`/`Err` outcome feeds the Breaker's `record_result` and the Log
    /// layer's completion line.
    pub async fn call<T, F, Fut>(&self, mut ctx: CallContext, inner: F) -> Result<T, ClientError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        // 1. Trace: inject x-trace-id without clobbering an existing value.
        let span_trace_id = self.tracer.current_span_trace_id();
        if let Some(id) = meshrpc_telemetry::resolve_trace_id(span_trace_id.as_deref(), ctx.custom_trace_id.as_deref()) {
            ctx.metadata
                .entry(meshrpc_telemetry::TRACE_ID_HEADER.to_string())
                .or_insert(id);
        }

        let limiter_resource = format!("{}:{}", ctx.service_key, ctx.method);

        // 2. RateLimit: a denial short-circuits; a backend error fails open.
        if self.limiter.is_enabled() {
            match self.limiter.allow(&limiter_resource).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ClientError::RateLimited { resource: limiter_resource });
                }
                Err(err) => {
                    meshrpc_telemetry::log_rate_limiter_internal_error(&ctx.service_key, &ctx.method, &err);
                }
            }
        }

        // Pull out everything the Timeout/Log layers need before `ctx`
        // (carrying the now-finalized metadata) moves into `inner`.
        let timeout = ctx.timeout;
        let has_caller_deadline = ctx.has_caller_deadline;
        let log_enabled = ctx.log_enabled;
        let service_key = ctx.service_key.clone();
        let method = ctx.method.clone();
        let target = ctx.target.clone();

        // 3. Breaker: scoped to the service key alone, distinct from the
        // limiter's `{serviceKey}:{method}` key. Cloned before `service_key`
        // moves into the Log layer's closure below.
        let breaker_resource = service_key.clone();

        // 4 + 5: Timeout wraps Log wraps the transport invocation.
        let timeout_and_log = async move {
            // 5. Log: record start before the transport runs.
            let start = Instant::now();
            let result = inner(ctx).await;
            meshrpc_telemetry::log_call_end(&service_key, &method, &target, start.elapsed(), log_enabled, result.as_ref().err().map(|e| e as &(dyn std::error::Error + 'static)));
            result
        };

        match self.breaker.before_call(&breaker_resource).await {
            Ok(()) => {
                let result = if has_caller_deadline {
                    timeout_and_log.await
                } else {
                    match tokio::time::timeout(timeout, timeout_and_log).await {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::DeadlineExceeded { elapsed: timeout }),
                    }
                };
                self.breaker.record_result(&breaker_resource, result.is_ok()).await;
                result
            }
            Err(err) => Err(err),
        }
    }
}
