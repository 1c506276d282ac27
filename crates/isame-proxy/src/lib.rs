//! Request dispatch pipeline and backend-state machinery for the isame
//! load balancer.
//!
//! # Architecture
//!
//! The front door accepts client connections and hands every request to
//! the dispatch pipeline, which composes the leaf components:
//!
//! ```text
//! listener -> dispatch
//!               |- rate limiter     (per-client sliding window, per upstream)
//!               |- retrier          (capped exponential backoff + jitter)
//!               |    |- balancer    (policy picks a healthy backend)
//!               |    |- breaker     (per-backend open/closed gate)
//!               |    '- forward     (streaming reverse-proxy primitive)
//!               '- metrics events
//!
//! health checker ----> shared health map (read by the balancer)
//! ```
//!
//! The health checker runs on its own cadence, one prober per backend,
//! and is the sole writer of the health map. Request handlers only ever
//! read snapshots of it.

pub mod balancer;
pub mod breaker;
pub mod dispatch;
pub mod health;
pub mod rate_limit;
pub mod retry;
pub mod server;
pub mod tls;

pub use balancer::Policy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use dispatch::Dispatcher;
pub use health::HealthChecker;
pub use rate_limit::RateLimiter;
pub use retry::Retrier;
pub use server::LbServer;
