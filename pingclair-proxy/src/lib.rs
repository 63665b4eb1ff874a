//! Pingclair edge reverse proxy (spec §4.2).
//!
//! `PingclairProxy` is the `pingora_proxy::ProxyHttp` implementation: Route
//! Table lookups, live-IP reconciliation, and upstream error classification.
//! `connection_filter` and `rate_limit` guard the listener and the request
//! path respectively; `metrics` exposes the Prometheus surface.

pub mod connection_filter;
pub mod metrics;
pub mod rate_limit;
pub mod server;

pub use connection_filter::PingclairConnectionFilter;
pub use rate_limit::{RateLimitConfig, RateLimitInfo, RateLimiter};
pub use server::PingclairProxy;
