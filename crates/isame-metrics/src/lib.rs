//! Metrics collection for the isame load balancer.
//!
//! The metrics system is built around three components:
//!
//! - [`MetricsRegistry`] - thread-safe storage for the exported metric
//!   families, with lock-free counters on the hot path
//! - [`MetricsCollector`] - the facade the rest of the system records
//!   through; a no-op when metrics are disabled
//! - [`MetricsServer`] - the side-car HTTP endpoint exposing the
//!   registry in Prometheus text format
//!
//! Exported metric families (namespace `isame_lb`):
//!
//! - `isame_lb_requests_total{upstream,backend,method,status}`
//! - `isame_lb_request_duration_seconds{upstream,backend,method}`
//! - `isame_lb_upstream_healthy{upstream,backend}`
//! - `isame_lb_active_connections`

mod collector;
mod registry;
mod server;

pub use collector::MetricsCollector;
pub use registry::MetricsRegistry;
pub use server::MetricsServer;
