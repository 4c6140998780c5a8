// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-service discovery watch loop. Deliberately has no back-reference
//! to [`crate::ClientManager`]: its only job is counting healthy instances
//! and logging, never dialing, so it needs nothing beyond a discovery
//! handle, the service name, and the manager-wide shutdown signal.

use std::time::Duration;

use meshrpc_discovery::Discovery;
use meshrpc_retry::CancellationToken;
use std::sync::Arc;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the watch loop for `service_name` until `shutdown` fires.
///
/// Each iteration calls [`Discovery::watch`] for a fresh update stream; a
/// successful call resets the reconnect backoff to 1s, a failed call or a
/// stream that closes mid-flight doubles it up to a 30s cap.
pub async fn run(discovery: Arc<dyn Discovery>, service_name: String, shutdown: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut receiver = match discovery.watch(&service_name).await {
            Ok(receiver) => receiver,
            Err(err) => {
                meshrpc_telemetry::log_watch_stream_error(&service_name, &err, backoff);
                if sleep_or_shutdown(backoff, &shutdown).await {
                    return;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        // A successful `watch()` call is the "normal" path: reset backoff.
        backoff = INITIAL_BACKOFF;
        let healthy = receiver.borrow().iter().filter(|i| i.healthy).count();
        meshrpc_telemetry::log_watch_update(&service_name, healthy);

        loop {
            tokio::select! {
                changed = receiver.changed() => {
                    match changed {
                        Ok(()) => {
                            let healthy = receiver.borrow().iter().filter(|i| i.healthy).count();
                            meshrpc_telemetry::log_watch_update(&service_name, healthy);
                        }
                        Err(_) => {
                            let closed = std::io::Error::other("discovery watch stream closed");
                            meshrpc_telemetry::log_watch_stream_error(&service_name, &closed, backoff);
                            break;
                        }
                    }
                }
                () = shutdown.cancelled() => return,
            }
        }

        if sleep_or_shutdown(backoff, &shutdown).await {
            return;
        }
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Sleep for `delay`, interruptible by shutdown. Returns `true` if shutdown
/// fired first (caller should return immediately).
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        () = shutdown.cancelled() => true,
    }
}
