// SPDX-License-Identifier: MIT OR Apache-2.0
//! The client connection manager: multiplexes outbound RPC calls across a
//! pool of connections, integrates with service discovery, and composes the
//! fixed Trace → RateLimit → Breaker → Timeout → Log interceptor chain on
//! every call.
//!
//! [`ClientManager`] owns two independent pieces of state — an immutable
//! per-service config map and a mutable connection cache — plus the
//! long-lived watch-loop tasks tracking discovery-mode services. It never
//! generates or parses protobuf itself: callers build their own generated
//! client stub around [`ConnectionEntry::channel`] and drive it through
//! [`ConnectionEntry::invoke`] so the interceptor chain and retry engine
//! stay generic over the RPC method being called.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod manager;
mod watch;

pub use connection::{from_status, map_status_code, CallOptions, ConnectionEntry, MetricsHandler, NoopMetricsHandler};
pub use manager::{ClientManager, ManagerStats};
