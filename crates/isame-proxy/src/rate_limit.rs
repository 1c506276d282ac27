//! Per-client sliding-window rate limiting, instantiated per upstream.
//!
//! Each client identity keeps the timestamps of its admitted requests,
//! pruned to the active window on every call. Admission succeeds while
//! the pruned count is strictly below `requests_per_ip`. Client records
//! allocate lazily on first sight; [`RateLimiter::sweep`] drops clients
//! whose windows have emptied, purely to bound memory.
//!
//! A coarse `RwLock` guards the client map, a per-client `Mutex` guards
//! each window list. Nothing blocks on I/O while holding either.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use isame_common::RateLimitConfig;

#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    requests_per_ip: u32,
    window: Duration,
    clients: RwLock<HashMap<String, Arc<Mutex<Vec<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            requests_per_ip: config.requests_per_ip,
            window: config.window(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_params(requests_per_ip: u32, window: Duration) -> Self {
        Self {
            enabled: true,
            requests_per_ip,
            window,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// A limiter that admits everything and accumulates no state.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            requests_per_ip: 0,
            window: Duration::ZERO,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn client(&self, client_id: &str) -> Arc<Mutex<Vec<Instant>>> {
        if let Some(window) = self
            .clients
            .read()
            .expect("rate limiter lock poisoned")
            .get(client_id)
        {
            return window.clone();
        }
        self.clients
            .write()
            .expect("rate limiter lock poisoned")
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Admit or reject one request for `client_id` at the current time.
    pub fn allow(&self, client_id: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let window = self.client(client_id);
        let mut requests = window.lock().expect("client window poisoned");

        let now = Instant::now();
        requests.retain(|t| now.duration_since(*t) < self.window);

        if requests.len() >= self.requests_per_ip as usize {
            return false;
        }

        requests.push(now);
        true
    }

    /// Number of admissions still inside the window for `client_id`.
    pub fn usage(&self, client_id: &str) -> usize {
        if !self.enabled {
            return 0;
        }

        let Some(window) = self
            .clients
            .read()
            .expect("rate limiter lock poisoned")
            .get(client_id)
            .cloned()
        else {
            return 0;
        };

        let requests = window.lock().expect("client window poisoned");
        let now = Instant::now();
        requests
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }

    /// Drop clients whose windows hold no live admissions. Correctness-
    /// neutral; bounds memory for churny client populations.
    pub fn sweep(&self) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let mut clients = self.clients.write().expect("rate limiter lock poisoned");
        clients.retain(|_, window| {
            let requests = window.lock().expect("client window poisoned");
            requests.iter().any(|t| now.duration_since(*t) < self.window)
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .expect("rate limiter lock poisoned")
            .len()
    }
}
