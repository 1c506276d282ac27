//! Per-backend circuit breaker.
//!
//! A two-state machine per backend URL: `Closed` passes requests
//! through, `Open` rejects them until a cooldown elapses. There is no
//! explicit half-open state; the first attempt after the cooldown is the
//! probe. If it succeeds the breaker is already closed again via
//! [`CircuitBreaker::record_success`], and if it fails the failure
//! counter re-opens it once the threshold is met again.
//!
//! URLs the breaker has never seen answer as attemptable and `Closed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use isame_common::CircuitBreakerConfig;

/// Breaker state for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
        }
    }
}

/// Failure tracking and admission gating, per backend URL.
#[derive(Debug)]
pub struct CircuitBreaker {
    enabled: bool,
    failure_threshold: u32,
    timeout: Duration,
    backends: RwLock<HashMap<String, Arc<Mutex<BreakerEntry>>>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_params(config.enabled, config.failure_threshold, config.timeout())
    }

    pub fn with_params(enabled: bool, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            enabled,
            failure_threshold,
            timeout,
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, url: &str) -> Option<Arc<Mutex<BreakerEntry>>> {
        self.backends
            .read()
            .expect("breaker lock poisoned")
            .get(url)
            .cloned()
    }

    fn entry_or_insert(&self, url: &str) -> Arc<Mutex<BreakerEntry>> {
        if let Some(entry) = self.entry(url) {
            return entry;
        }
        self.backends
            .write()
            .expect("breaker lock poisoned")
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new())))
            .clone()
    }

    /// Whether a request may be attempted against `url`. An open breaker
    /// whose cooldown has elapsed closes here and admits the caller as
    /// the probe.
    pub fn can_attempt(&self, url: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(entry) = self.entry(url) else {
            return true;
        };

        let mut entry = entry.lock().expect("breaker entry poisoned");
        if entry.state == BreakerState::Open {
            let cooled = entry
                .last_failure_time
                .map(|t| t.elapsed() >= self.timeout)
                .unwrap_or(true);
            if cooled {
                debug!(backend = %url, "circuit breaker cooldown elapsed, closing");
                entry.state = BreakerState::Closed;
                entry.consecutive_failures = 0;
                return true;
            }
            return false;
        }

        true
    }

    /// Record a successful attempt: resets the counter and forces
    /// `Closed`. URLs with no recorded failures stay untracked.
    pub fn record_success(&self, url: &str) {
        if !self.enabled {
            return;
        }

        let Some(entry) = self.entry(url) else {
            return;
        };

        let mut entry = entry.lock().expect("breaker entry poisoned");
        entry.consecutive_failures = 0;
        entry.state = BreakerState::Closed;
    }

    /// Record a failed attempt; opens the breaker once the threshold of
    /// consecutive failures is reached.
    pub fn record_failure(&self, url: &str) {
        if !self.enabled {
            return;
        }

        let entry = self.entry_or_insert(url);
        let mut entry = entry.lock().expect("breaker entry poisoned");

        entry.consecutive_failures += 1;
        entry.last_failure_time = Some(Instant::now());

        if entry.consecutive_failures >= self.failure_threshold
            && entry.state == BreakerState::Closed
        {
            warn!(
                backend = %url,
                failures = entry.consecutive_failures,
                "circuit breaker opened"
            );
            entry.state = BreakerState::Open;
        }
    }

    /// Current state for `url`; untracked URLs are `Closed`.
    pub fn state(&self, url: &str) -> BreakerState {
        match self.entry(url) {
            Some(entry) => entry.lock().expect("breaker entry poisoned").state,
            None => BreakerState::Closed,
        }
    }

    /// Force a backend's breaker back to `Closed` with a clean counter.
    pub fn reset(&self, url: &str) {
        let Some(entry) = self.entry(url) else {
            return;
        };
        let mut entry = entry.lock().expect("breaker entry poisoned");
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
    }
}
