use thiserror::Error;

/// Errors surfaced by the dispatch pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum LbError {
    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("no healthy backends available")]
    NoHealthyBackends,

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("backend transport error: {0}")]
    BackendTransport(String),

    #[error("backend returned status {0}")]
    BackendStatus(u16),

    #[error("request body exceeds maximum allowed size of {0} bytes")]
    PayloadTooLarge(usize),

    #[error("invalid load balancing algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LbError>;
