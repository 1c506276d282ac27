//! Retry with capped exponential backoff and jitter.
//!
//! Wraps one logical client request around up to `max_attempts`
//! invocations of an attempt closure. Between attempts k and k+1 the
//! retrier sleeps `min(max_backoff, initial_backoff * 2^(k-1))`
//! multiplied by a uniform jitter in [0.75, 1.25); the cap applies
//! before the jitter. The jitter spread keeps synchronized clients from
//! retrying in lockstep.
//!
//! The retrier knows nothing about HTTP. It sees opaque [`LbError`]s
//! and retries all of them except [`LbError::NoHealthyBackends`], where
//! a fresh attempt cannot observe a different outcome.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use isame_common::{LbError, Result, RetryConfig};

#[derive(Debug, Clone)]
pub struct Retrier {
    enabled: bool,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Retrier {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_params(
            config.enabled,
            config.max_attempts,
            config.initial_backoff(),
            config.max_backoff(),
        )
    }

    pub fn with_params(
        enabled: bool,
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            enabled,
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Total invocation budget; disabled mode collapses to 1.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// The retryability predicate.
    pub fn should_retry(&self, err: &LbError) -> bool {
        !matches!(err, LbError::NoHealthyBackends)
    }

    /// Backoff before attempt `attempt + 1` (attempts are 1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = 2f64.powi(attempt.saturating_sub(1) as i32);
        let nominal = self.initial_backoff.as_secs_f64() * exponent;
        let capped = nominal.min(self.max_backoff.as_secs_f64());

        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Run `attempt_fn` until it succeeds, a non-retryable error occurs,
    /// or the attempt budget is exhausted. The closure receives the
    /// 1-indexed attempt number.
    pub async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry(&err) {
                        return Err(err);
                    }
                    if attempt < max_attempts {
                        let backoff = self.backoff(attempt);
                        debug!(
                            attempt,
                            max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "attempt failed, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.expect("retry loop runs at least one attempt"))
    }
}
