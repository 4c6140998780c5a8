// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured-logging façade over `tracing` for the meshrpc client
//! connection manager.
//!
//! Every crate here reaches for `tracing::{debug,info,warn,error}` directly
//! rather than inventing a bespoke logger trait; this crate's only job is to
//! standardize the *fields* the interceptor chain and watch loop attach to
//! each call so log lines are uniformly greppable, and to carry the
//! trace-id propagation contract in one place.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

/// Metadata header outbound trace-ids are injected under by the Trace
/// interceptor.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Resolve the trace-id to propagate for an outbound call: an active
/// OpenTelemetry span's trace-id wins when present, otherwise the custom
/// header value already carried on the caller's context, otherwise `None`
/// (the Trace interceptor then omits the header rather than inventing an
/// id).
#[must_use]
pub fn resolve_trace_id(otel_span_trace_id: Option<&str>, custom_header: Option<&str>) -> Option<String> {
    otel_span_trace_id
        .filter(|id| !id.is_empty())
        .or(custom_header.filter(|id| !id.is_empty()))
        .map(str::to_owned)
}

/// Log the end of an outbound call: DEBUG on success, ERROR on failure,
/// suppressed entirely when `log_enabled` is `false`.
pub fn log_call_end(
    service_key: &str,
    method: &str,
    target: &str,
    duration: Duration,
    log_enabled: bool,
    error: Option<&(dyn std::error::Error + 'static)>,
) {
    if !log_enabled {
        return;
    }
    let duration_ms = duration.as_millis() as u64;
    match error {
        Some(err) => {
            tracing::error!(
                service_key,
                method,
                target,
                duration_ms,
                error = %err,
                "outbound call failed"
            );
        }
        None => {
            tracing::debug!(
                service_key,
                method,
                target,
                duration_ms,
                "outbound call completed"
            );
        }
    }
}

/// Log a rate-limiter internal failure: the limiter is bypassed (the call
/// is allowed) and the failure is surfaced at WARN rather than propagated.
pub fn log_rate_limiter_internal_error(
    service_key: &str,
    method: &str,
    err: &(dyn std::error::Error + 'static),
) {
    tracing::warn!(
        service_key,
        method,
        error = %err,
        "rate limiter internal error, allowing call"
    );
}

/// Log the watch loop's healthy-instance-count transition: WARN when the
/// set drops to zero, INFO otherwise.
pub fn log_watch_update(service_name: &str, healthy_count: usize) {
    if healthy_count == 0 {
        tracing::warn!(service_name, healthy_count, "no healthy instances");
    } else {
        tracing::info!(service_name, healthy_count, "healthy instances available");
    }
}

/// Log a watch-stream failure before the watch loop re-enters its outer
/// retry loop with exponential backoff.
pub fn log_watch_stream_error(
    service_name: &str,
    err: &(dyn std::error::Error + 'static),
    backoff: Duration,
) {
    tracing::warn!(
        service_name,
        error = %err,
        backoff_ms = backoff.as_millis() as u64,
        "discovery watch stream failed, retrying"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otel_span_id_wins_over_custom_header() {
        let resolved = resolve_trace_id(Some("otel-123"), Some("custom-456"));
        assert_eq!(resolved.as_deref(), Some("otel-123"));
    }

    #[test]
    fn falls_back_to_custom_header_when_no_span() {
        let resolved = resolve_trace_id(None, Some("custom-456"));
        assert_eq!(resolved.as_deref(), Some("custom-456"));
    }

    #[test]
    fn empty_strings_are_treated_as_absent() {
        let resolved = resolve_trace_id(Some(""), Some("custom-456"));
        assert_eq!(resolved.as_deref(), Some("custom-456"));
    }

    #[test]
    fn no_ids_available_resolves_to_none() {
        assert_eq!(resolve_trace_id(None, None), None);
    }
}
