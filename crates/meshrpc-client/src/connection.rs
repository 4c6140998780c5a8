// SPDX-License-Identifier: MIT OR Apache-2.0
//! A single live transport connection plus the interceptor chain composed
//! onto it at dial time.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrpc_error::{ClientError, RpcCode};
use meshrpc_interceptor::{CallContext, InterceptorChain};
use tonic::transport::Channel;

/// Collaborator consulted after a call completes, for call-volume/latency
/// observability. Not part of the fixed interceptor chain — a manager-wide
/// injectable the way `breaker`/`limiter`/`tracer` are, reported from
/// outside the chain rather than as a sixth layer.
pub trait MetricsHandler: Send + Sync {
    /// Report one completed call.
    fn record_call(&self, service_key: &str, method: &str, duration: Duration, success: bool);
}

/// [`MetricsHandler`] that discards everything; the manager's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsHandler;

impl MetricsHandler for NoopMetricsHandler {
    fn record_call(&self, _service_key: &str, _method: &str, _duration: Duration, _success: bool) {}
}

/// Map a `tonic` status code onto the taxonomy [`RpcCode`] callers match
/// retry conditions against.
#[must_use]
pub fn map_status_code(code: tonic::Code) -> RpcCode {
    match code {
        tonic::Code::Ok => RpcCode::Ok,
        tonic::Code::Cancelled => RpcCode::Cancelled,
        tonic::Code::Unknown => RpcCode::Unknown,
        tonic::Code::InvalidArgument => RpcCode::InvalidArgument,
        tonic::Code::DeadlineExceeded => RpcCode::DeadlineExceeded,
        tonic::Code::NotFound => RpcCode::NotFound,
        tonic::Code::AlreadyExists => RpcCode::AlreadyExists,
        tonic::Code::PermissionDenied => RpcCode::PermissionDenied,
        tonic::Code::ResourceExhausted => RpcCode::ResourceExhausted,
        tonic::Code::FailedPrecondition => RpcCode::FailedPrecondition,
        tonic::Code::Aborted => RpcCode::Aborted,
        tonic::Code::OutOfRange => RpcCode::OutOfRange,
        tonic::Code::Unimplemented => RpcCode::Unimplemented,
        tonic::Code::Internal => RpcCode::Internal,
        tonic::Code::Unavailable => RpcCode::Unavailable,
        tonic::Code::DataLoss => RpcCode::DataLoss,
        tonic::Code::Unauthenticated => RpcCode::Unauthenticated,
    }
}

/// Convert a `tonic::Status` RPC failure into the workspace's error
/// taxonomy, preserving the status as the error's source.
#[must_use]
pub fn from_status(status: tonic::Status) -> ClientError {
    let code = map_status_code(status.code());
    ClientError::transport_with_code(code, status)
}

/// Per-call options threaded into the interceptor chain's [`CallContext`].
///
/// `invoke` is the common case (no caller-supplied trace-id, only the
/// connection's own OTel span is consulted); `invoke_with` takes this
/// explicitly so a caller that already carries its own trace-id — read from
/// whichever of the configured key, `"trace_id"`, or `"traceId"` it found
/// set (spec.md §4.6.2's extraction priority 2–4) — can hand it to the
/// Trace layer as the fallback used when no OTel span is active.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller-supplied trace-id, consulted when no OTel span is active.
    pub custom_trace_id: Option<String>,
}

impl CallOptions {
    /// The default: no caller-supplied trace-id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a caller-supplied trace-id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.custom_trace_id = Some(trace_id.into());
        self
    }
}

/// One live, dialed connection to a resolved target, with the five-layer
/// interceptor chain already composed onto it.
pub struct ConnectionEntry {
    channel: Channel,
    interceptors: Arc<InterceptorChain>,
    metrics: Arc<dyn MetricsHandler>,
    service_key: String,
    target: String,
    timeout: Duration,
    log_enabled: bool,
}

impl ConnectionEntry {
    pub(crate) fn new(
        channel: Channel,
        interceptors: Arc<InterceptorChain>,
        metrics: Arc<dyn MetricsHandler>,
        service_key: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
        log_enabled: bool,
    ) -> Self {
        Self {
            channel,
            interceptors,
            metrics,
            service_key: service_key.into(),
            target: target.into(),
            timeout,
            log_enabled,
        }
    }

    /// A cheap clone of the underlying `tonic` channel, suitable for
    /// constructing a generated client stub (`SomeClient::new(conn.channel())`).
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// The resolved `host:port` this connection is dialed to.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run one outbound call through the composed interceptor chain. `op`
    /// receives the [`CallContext`] — including any `x-trace-id` metadata
    /// the Trace layer injected — and is expected to issue the actual RPC
    /// against [`ConnectionEntry::channel`], mapping its `tonic::Status`
    /// failure through [`from_status`].
    ///
    /// Equivalent to `invoke_with(method, CallOptions::new(), op)` — no
    /// caller-supplied trace-id, only an active OTel span is consulted.
    pub async fn invoke<T, F, Fut>(&self, method: &str, op: F) -> Result<T, ClientError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        self.invoke_with(method, CallOptions::new(), op).await
    }

    /// Like [`ConnectionEntry::invoke`], but with [`CallOptions`] the caller
    /// controls — in particular a custom trace-id the Trace layer falls
    /// back to when no OTel span is active (spec.md §4.6.2).
    pub async fn invoke_with<T, F, Fut>(
        &self,
        method: &str,
        options: CallOptions,
        op: F,
    ) -> Result<T, ClientError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        let mut ctx = CallContext::new(self.service_key.clone(), method, self.target.clone(), self.timeout);
        ctx.log_enabled = self.log_enabled;
        ctx.custom_trace_id = options.custom_trace_id;

        let start = Instant::now();
        let result = self.interceptors.call(ctx, op).await;
        self.metrics
            .record_call(&self.service_key, method, start.elapsed(), result.is_ok());
        result
    }
}
