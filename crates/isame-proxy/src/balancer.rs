//! Backend selection policies.
//!
//! Every policy shares one narrow contract: given the upstream's
//! backends and a health snapshot, pick one backend or fail with
//! [`LbError::NoHealthyBackends`]. Backends absent from the snapshot are
//! treated as healthy, so a racing first probe never starves traffic.
//!
//! Policies are a sealed enum rather than trait objects; the one extra
//! capability (connection tracking for least-connections) is a flag the
//! dispatcher queries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use isame_common::{Backend, LbError, Result};

/// A health snapshot: backend URL to healthy flag. Missing entries read
/// as healthy.
pub type HealthSnapshot = HashMap<String, bool>;

/// A balancing policy with its internal state.
#[derive(Debug)]
pub enum Policy {
    /// Rotate through healthy backends; the counter is shared across
    /// calls and advanced atomically.
    RoundRobin { counter: AtomicU64 },

    /// Nginx-style smooth weighted round robin over running per-backend
    /// current weights.
    WeightedRoundRobin { current: Mutex<HashMap<String, i64>> },

    /// Pick the healthy backend with the fewest in-flight requests.
    LeastConnections { active: Mutex<HashMap<String, i64>> },
}

impl Policy {
    /// Build the policy for a configured algorithm name. The empty
    /// string falls back to round robin, matching config defaulting.
    pub fn for_algorithm(algorithm: &str) -> Result<Self> {
        match algorithm {
            "round_robin" | "" => Ok(Self::RoundRobin {
                counter: AtomicU64::new(0),
            }),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin {
                current: Mutex::new(HashMap::new()),
            }),
            "least_connections" => Ok(Self::LeastConnections {
                active: Mutex::new(HashMap::new()),
            }),
            other => Err(LbError::InvalidAlgorithm(other.to_string())),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::RoundRobin { .. } => "round_robin",
            Self::WeightedRoundRobin { .. } => "weighted_round_robin",
            Self::LeastConnections { .. } => "least_connections",
        }
    }

    /// Whether the dispatcher must bracket each attempt with
    /// [`Policy::increment`] / [`Policy::decrement`].
    pub fn tracks_connections(&self) -> bool {
        matches!(self, Self::LeastConnections { .. })
    }

    /// Select one backend among the healthy subset of `backends`.
    pub fn select_backend(
        &self,
        backends: &[Backend],
        health: &HealthSnapshot,
    ) -> Result<Backend> {
        let healthy: Vec<&Backend> = backends
            .iter()
            .filter(|b| health.get(&b.url).copied().unwrap_or(true))
            .collect();

        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackends);
        }

        match self {
            Self::RoundRobin { counter } => {
                let prev = counter.fetch_add(1, Ordering::Relaxed);
                Ok(healthy[(prev % healthy.len() as u64) as usize].clone())
            }
            Self::WeightedRoundRobin { current } => {
                let mut current = current.lock().expect("policy lock poisoned");

                let mut total: i64 = 0;
                for backend in &healthy {
                    total += i64::from(backend.weight);
                    *current.entry(backend.url.clone()).or_insert(0) += i64::from(backend.weight);
                }

                // strict > keeps the earliest backend in input order on ties
                let mut selected: &Backend = healthy[0];
                let mut max_weight = current[&selected.url];
                for &backend in healthy.iter().skip(1) {
                    let weight = current[&backend.url];
                    if weight > max_weight {
                        max_weight = weight;
                        selected = backend;
                    }
                }

                *current.get_mut(&selected.url).expect("selected weight present") -= total;
                Ok(selected.clone())
            }
            Self::LeastConnections { active } => {
                let active = active.lock().expect("policy lock poisoned");
                let selected = healthy
                    .iter()
                    .min_by_key(|b| active.get(&b.url).copied().unwrap_or(0))
                    .expect("healthy set is not empty");
                Ok((*selected).clone())
            }
        }
    }

    /// Note a request in flight against `url`. Only meaningful for
    /// least-connections; a no-op otherwise.
    pub fn increment(&self, url: &str) {
        if let Self::LeastConnections { active } = self {
            let mut active = active.lock().expect("policy lock poisoned");
            *active.entry(url.to_string()).or_insert(0) += 1;
        }
    }

    /// Note a request completed against `url` (success or failure).
    pub fn decrement(&self, url: &str) {
        if let Self::LeastConnections { active } = self {
            let mut active = active.lock().expect("policy lock poisoned");
            if let Some(count) = active.get_mut(url) {
                if *count > 0 {
                    *count -= 1;
                }
            }
        }
    }

    /// Current in-flight count for `url` under least-connections.
    pub fn active_connections(&self, url: &str) -> i64 {
        match self {
            Self::LeastConnections { active } => active
                .lock()
                .expect("policy lock poisoned")
                .get(url)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(urls: &[&str]) -> Vec<Backend> {
        urls.iter().map(|u| Backend::new(*u)).collect()
    }

    fn count_selections(policy: &Policy, backends: &[Backend], n: usize) -> HashMap<String, usize> {
        let health = HealthSnapshot::new();
        let mut counts = HashMap::new();
        for _ in 0..n {
            let backend = policy.select_backend(backends, &health).unwrap();
            *counts.entry(backend.url).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_for_algorithm() {
        assert_eq!(Policy::for_algorithm("round_robin").unwrap().algorithm(), "round_robin");
        assert_eq!(Policy::for_algorithm("").unwrap().algorithm(), "round_robin");
        assert_eq!(
            Policy::for_algorithm("weighted_round_robin").unwrap().algorithm(),
            "weighted_round_robin"
        );
        assert_eq!(
            Policy::for_algorithm("least_connections").unwrap().algorithm(),
            "least_connections"
        );
        assert!(matches!(
            Policy::for_algorithm("ip_hash"),
            Err(LbError::InvalidAlgorithm(_))
        ));
    }

    #[test]
    fn test_empty_backends() {
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let result = policy.select_backend(&[], &HealthSnapshot::new());
        assert!(matches!(result, Err(LbError::NoHealthyBackends)));
    }

    #[test]
    fn test_all_unhealthy() {
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let backends = backends(&["http://a:1", "http://b:2"]);
        let mut health = HealthSnapshot::new();
        health.insert("http://a:1".into(), false);
        health.insert("http://b:2".into(), false);

        let result = policy.select_backend(&backends, &health);
        assert!(matches!(result, Err(LbError::NoHealthyBackends)));
    }

    #[test]
    fn test_round_robin_even_distribution() {
        // three healthy backends, nine requests: three picks each
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let backends = backends(&["http://a:1", "http://b:2", "http://c:3"]);
        let counts = count_selections(&policy, &backends, 9);

        assert_eq!(counts["http://a:1"], 3);
        assert_eq!(counts["http://b:2"], 3);
        assert_eq!(counts["http://c:3"], 3);
    }

    #[test]
    fn test_round_robin_order() {
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let backends = backends(&["http://a:1", "http://b:2"]);
        let health = HealthSnapshot::new();

        assert_eq!(policy.select_backend(&backends, &health).unwrap().url, "http://a:1");
        assert_eq!(policy.select_backend(&backends, &health).unwrap().url, "http://b:2");
        assert_eq!(policy.select_backend(&backends, &health).unwrap().url, "http://a:1");
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        // A healthy, B unhealthy, C healthy; six calls: B never chosen
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let backends = backends(&["http://a:1", "http://b:2", "http://c:3"]);
        let mut health = HealthSnapshot::new();
        health.insert("http://b:2".into(), false);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..6 {
            let backend = policy.select_backend(&backends, &health).unwrap();
            *counts.entry(backend.url).or_insert(0) += 1;
        }

        assert_eq!(counts.get("http://b:2"), None);
        assert_eq!(counts["http://a:1"], 3);
        assert_eq!(counts["http://c:3"], 3);
    }

    #[test]
    fn test_missing_health_entry_is_healthy() {
        let policy = Policy::for_algorithm("round_robin").unwrap();
        let backends = backends(&["http://a:1"]);
        let mut health = HealthSnapshot::new();
        health.insert("http://other:9".into(), false);

        assert!(policy.select_backend(&backends, &health).is_ok());
    }

    #[test]
    fn test_weighted_frequencies() {
        // weights A:3 B:2 C:1 over 60 picks: exactly 30/20/10
        let policy = Policy::for_algorithm("weighted_round_robin").unwrap();
        let backends = vec![
            Backend::with_weight("http://a:1", 3),
            Backend::with_weight("http://b:2", 2),
            Backend::with_weight("http://c:3", 1),
        ];
        let counts = count_selections(&policy, &backends, 60);

        assert_eq!(counts["http://a:1"], 30);
        assert_eq!(counts["http://b:2"], 20);
        assert_eq!(counts["http://c:3"], 10);
    }

    #[test]
    fn test_weighted_smoothness() {
        // the dominant backend must not run more than twice in a row
        // early in the sequence
        let policy = Policy::for_algorithm("weighted_round_robin").unwrap();
        let backends = vec![
            Backend::with_weight("http://a:1", 3),
            Backend::with_weight("http://b:2", 2),
            Backend::with_weight("http://c:3", 1),
        ];
        let health = HealthSnapshot::new();

        let picks: Vec<String> = (0..7)
            .map(|_| policy.select_backend(&backends, &health).unwrap().url)
            .collect();

        let mut max_run = 0;
        let mut run = 0;
        for pick in &picks {
            if pick == "http://a:1" {
                run += 1;
                max_run = max_run.max(run);
            } else {
                run = 0;
            }
        }
        assert!(max_run <= 2, "run of {} in {:?}", max_run, picks);
    }

    #[test]
    fn test_weighted_single_backend() {
        let policy = Policy::for_algorithm("weighted_round_robin").unwrap();
        let backends = vec![Backend::with_weight("http://a:1", 5)];
        let counts = count_selections(&policy, &backends, 4);
        assert_eq!(counts["http://a:1"], 4);
    }

    #[test]
    fn test_weighted_tie_breaks_by_order() {
        // equal weights tie on every contested pick; the earliest
        // configured backend must win each opening tie
        let policy = Policy::for_algorithm("weighted_round_robin").unwrap();
        let backends = vec![
            Backend::with_weight("http://a:1", 2),
            Backend::with_weight("http://b:2", 2),
        ];
        let health = HealthSnapshot::new();

        let picks: Vec<String> = (0..4)
            .map(|_| policy.select_backend(&backends, &health).unwrap().url)
            .collect();
        assert_eq!(
            picks,
            vec!["http://a:1", "http://b:2", "http://a:1", "http://b:2"]
        );
    }

    #[test]
    fn test_weighted_new_backend_starts_at_zero() {
        let policy = Policy::for_algorithm("weighted_round_robin").unwrap();
        let mut backends = vec![Backend::with_weight("http://a:1", 2)];
        let health = HealthSnapshot::new();

        for _ in 0..3 {
            policy.select_backend(&backends, &health).unwrap();
        }

        // a backend appearing mid-stream competes from current weight 0
        backends.push(Backend::with_weight("http://b:2", 2));
        let counts = count_selections(&policy, &backends, 8);
        assert!(counts["http://b:2"] >= 3);
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let policy = Policy::for_algorithm("least_connections").unwrap();
        let backends = backends(&["http://a:1", "http://b:2"]);
        let health = HealthSnapshot::new();

        policy.increment("http://a:1");
        policy.increment("http://a:1");
        policy.increment("http://b:2");

        let backend = policy.select_backend(&backends, &health).unwrap();
        assert_eq!(backend.url, "http://b:2");
    }

    #[test]
    fn test_least_connections_tie_breaks_by_order() {
        let policy = Policy::for_algorithm("least_connections").unwrap();
        let backends = backends(&["http://a:1", "http://b:2"]);
        let health = HealthSnapshot::new();

        let backend = policy.select_backend(&backends, &health).unwrap();
        assert_eq!(backend.url, "http://a:1");
    }

    #[test]
    fn test_least_connections_decrement_floor() {
        let policy = Policy::for_algorithm("least_connections").unwrap();
        policy.decrement("http://a:1");
        assert_eq!(policy.active_connections("http://a:1"), 0);

        policy.increment("http://a:1");
        policy.decrement("http://a:1");
        policy.decrement("http://a:1");
        assert_eq!(policy.active_connections("http://a:1"), 0);
    }

    #[test]
    fn test_least_connections_skips_unhealthy() {
        let policy = Policy::for_algorithm("least_connections").unwrap();
        let backends = backends(&["http://a:1", "http://b:2"]);
        let mut health = HealthSnapshot::new();
        health.insert("http://a:1".into(), false);

        policy.increment("http://b:2");
        policy.increment("http://b:2");

        // b has more connections but is the only healthy choice
        let backend = policy.select_backend(&backends, &health).unwrap();
        assert_eq!(backend.url, "http://b:2");
    }

    #[test]
    fn test_tracks_connections_flag() {
        assert!(!Policy::for_algorithm("round_robin").unwrap().tracks_connections());
        assert!(!Policy::for_algorithm("weighted_round_robin").unwrap().tracks_connections());
        assert!(Policy::for_algorithm("least_connections").unwrap().tracks_connections());
    }

    #[test]
    fn test_round_robin_concurrent_counts() {
        use std::sync::Arc;
        use std::thread;

        let policy = Arc::new(Policy::for_algorithm("round_robin").unwrap());
        let backends = Arc::new(backends(&["http://a:1", "http://b:2", "http://c:3"]));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let policy = policy.clone();
            let backends = backends.clone();
            handles.push(thread::spawn(move || {
                let health = HealthSnapshot::new();
                let mut local: HashMap<String, usize> = HashMap::new();
                for _ in 0..100 {
                    let backend = policy.select_backend(&backends, &health).unwrap();
                    *local.entry(backend.url).or_insert(0) += 1;
                }
                local
            }));
        }

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (url, count) in handle.join().unwrap() {
                *totals.entry(url).or_insert(0) += count;
            }
        }

        // 600 selections over 3 backends: exactly even regardless of
        // interleaving, because the counter is shared and atomic
        assert_eq!(totals["http://a:1"], 200);
        assert_eq!(totals["http://b:2"], 200);
        assert_eq!(totals["http://c:3"], 200);
    }
}
