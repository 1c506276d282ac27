//! Shared types for the isame load balancer.
//!
//! This crate holds the pieces every other component depends on:
//!
//! - [`config`] - the TOML configuration schema, loading and validation
//! - [`error`] - the [`LbError`] type surfaced throughout the system
//!
//! Configuration is read once at startup and immutable afterwards; the
//! rest of the system holds shared references into it.

pub mod config;
pub mod error;

pub use config::{
    Backend, CircuitBreakerConfig, Config, HealthConfig, MetricsConfig, RateLimitConfig,
    RetryConfig, ServerConfig, TlsConfig, Upstream,
};
pub use error::{LbError, Result};
