//! Active health checking.
//!
//! One prober task per backend, each on its own cadence. A probe is a
//! GET against `backend_url + path` with the configured deadline; a 2xx
//! response is good, anything else (transport error, timeout, other
//! status) is bad. Status flips are threshold-based in both directions.
//!
//! The checker is the sole writer of the status map. Consumers read
//! point-in-time snapshots and must tolerate them going stale; backends
//! missing from the map read as healthy so a racing first probe never
//! starves traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use isame_common::{HealthConfig, Upstream};
use isame_metrics::MetricsCollector;

/// Health state for one backend.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub healthy: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
}

impl BackendHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_check: None,
        }
    }
}

struct Inner {
    config: HealthConfig,
    statuses: RwLock<HashMap<String, Arc<Mutex<BackendHealth>>>>,
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
}

/// Periodic active prober maintaining the shared health map.
pub struct HealthChecker {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig, metrics: Arc<MetricsCollector>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("reqwest client construction cannot fail with these options");

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                statuses: RwLock::new(HashMap::new()),
                client,
                metrics,
            }),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Seed every backend as healthy and spawn one prober per backend.
    /// A no-op when health checking is disabled.
    pub fn start(&self, upstreams: &[Upstream]) {
        if !self.inner.config.enabled {
            info!("health checker disabled");
            return;
        }

        {
            let mut statuses = self.inner.statuses.write().expect("health lock poisoned");
            for upstream in upstreams {
                for backend in &upstream.backends {
                    statuses
                        .entry(backend.url.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(BackendHealth::new())));
                    self.inner
                        .metrics
                        .set_backend_health(&upstream.name, &backend.url, true);
                }
            }
        }

        let mut handles = self.handles.lock().expect("handle list poisoned");
        for upstream in upstreams {
            for backend in &upstream.backends {
                let inner = self.inner.clone();
                let upstream_name = upstream.name.clone();
                let url = backend.url.clone();
                let shutdown_rx = self.shutdown_tx.subscribe();
                handles.push(tokio::spawn(probe_loop(inner, upstream_name, url, shutdown_rx)));
            }
        }

        info!(backends = handles.len(), "health checker started");
    }

    /// Signal every prober and wait for them to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock().expect("handle list poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
        info!("health checker stopped");
    }

    /// Whether `url` is currently healthy. Unknown backends are healthy.
    pub fn is_healthy(&self, url: &str) -> bool {
        let statuses = self.inner.statuses.read().expect("health lock poisoned");
        match statuses.get(url) {
            Some(entry) => entry.lock().expect("health entry poisoned").healthy,
            None => true,
        }
    }

    /// Point-in-time copy of the full health map.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        let statuses = self.inner.statuses.read().expect("health lock poisoned");
        statuses
            .iter()
            .map(|(url, entry)| {
                (
                    url.clone(),
                    entry.lock().expect("health entry poisoned").healthy,
                )
            })
            .collect()
    }

    /// Detailed status for one backend; unknown backends report the
    /// optimistic initial state.
    pub fn status(&self, url: &str) -> BackendHealth {
        let statuses = self.inner.statuses.read().expect("health lock poisoned");
        match statuses.get(url) {
            Some(entry) => entry.lock().expect("health entry poisoned").clone(),
            None => BackendHealth::new(),
        }
    }

    /// Feed one probe outcome into the status machine. Exposed for the
    /// prober tasks and for tests.
    pub fn apply_probe(&self, upstream: &str, url: &str, good: bool) {
        self.inner.apply_probe(upstream, url, good);
    }
}

impl Inner {
    async fn probe(&self, url: &str) -> bool {
        let probe_url = format!("{}{}", url, self.config.path);
        match self.client.get(&probe_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn apply_probe(&self, upstream: &str, url: &str, good: bool) {
        let entry = {
            let statuses = self.statuses.read().expect("health lock poisoned");
            match statuses.get(url) {
                Some(entry) => entry.clone(),
                None => return,
            }
        };

        let mut status = entry.lock().expect("health entry poisoned");
        status.last_check = Some(Instant::now());

        if good {
            status.consecutive_successes += 1;
            status.consecutive_failures = 0;

            if !status.healthy && status.consecutive_successes >= self.config.healthy_threshold {
                status.healthy = true;
                info!(
                    backend = %url,
                    successes = status.consecutive_successes,
                    "backend recovered"
                );
            }
        } else {
            status.consecutive_failures += 1;
            status.consecutive_successes = 0;

            if status.healthy && status.consecutive_failures >= self.config.unhealthy_threshold {
                status.healthy = false;
                warn!(
                    backend = %url,
                    failures = status.consecutive_failures,
                    "backend marked unhealthy"
                );
            }
        }

        self.metrics.set_backend_health(upstream, url, status.healthy);
    }
}

async fn probe_loop(
    inner: Arc<Inner>,
    upstream: String,
    url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(inner.config.interval());
    // consume the immediate first tick so probes start one interval in
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {
                let good = inner.probe(&url).await;
                inner.apply_probe(&upstream, &url, good);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isame_common::Backend;

    fn config(interval_secs: u64) -> HealthConfig {
        HealthConfig {
            enabled: true,
            interval_secs,
            timeout_secs: 1,
            path: "/health".into(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }

    fn upstream(urls: &[&str]) -> Upstream {
        Upstream {
            name: "web".into(),
            algorithm: "round_robin".into(),
            backends: urls.iter().map(|u| Backend::new(*u)).collect(),
            rate_limit: None,
        }
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(config(30), Arc::new(MetricsCollector::disabled()))
    }

    #[tokio::test]
    async fn test_start_seeds_healthy() {
        let checker = checker();
        checker.start(&[upstream(&["http://a:1", "http://b:2"])]);

        assert!(checker.is_healthy("http://a:1"));
        assert!(checker.is_healthy("http://b:2"));
        let snapshot = checker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.values().all(|h| *h));

        checker.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_backend_is_healthy() {
        let checker = checker();
        assert!(checker.is_healthy("http://never-seen:9"));
        let status = checker.status("http://never-seen:9");
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_flip_at_threshold() {
        let checker = checker();
        checker.start(&[upstream(&["http://a:1"])]);

        checker.apply_probe("web", "http://a:1", false);
        checker.apply_probe("web", "http://a:1", false);
        assert!(checker.is_healthy("http://a:1"));

        checker.apply_probe("web", "http://a:1", false);
        assert!(!checker.is_healthy("http://a:1"));

        checker.stop().await;
    }

    #[tokio::test]
    async fn test_recovery_flip_at_threshold() {
        let checker = checker();
        checker.start(&[upstream(&["http://a:1"])]);

        for _ in 0..3 {
            checker.apply_probe("web", "http://a:1", false);
        }
        assert!(!checker.is_healthy("http://a:1"));

        checker.apply_probe("web", "http://a:1", true);
        assert!(!checker.is_healthy("http://a:1"));

        checker.apply_probe("web", "http://a:1", true);
        assert!(checker.is_healthy("http://a:1"));

        checker.stop().await;
    }

    #[tokio::test]
    async fn test_counter_exclusivity() {
        // at any instant one of the two counters is zero
        let checker = checker();
        checker.start(&[upstream(&["http://a:1"])]);

        let outcomes = [true, true, false, true, false, false, false, true];
        for good in outcomes {
            checker.apply_probe("web", "http://a:1", good);
            let status = checker.status("http://a:1");
            assert!(
                status.consecutive_successes == 0 || status.consecutive_failures == 0,
                "both counters nonzero: {:?}",
                status
            );
        }

        checker.stop().await;
    }

    #[tokio::test]
    async fn test_success_streak_interrupted_by_failure() {
        let checker = checker();
        checker.start(&[upstream(&["http://a:1"])]);

        checker.apply_probe("web", "http://a:1", false);
        checker.apply_probe("web", "http://a:1", false);
        checker.apply_probe("web", "http://a:1", true);
        let status = checker.status("http://a:1");
        assert_eq!(status.consecutive_successes, 1);
        assert_eq!(status.consecutive_failures, 0);

        checker.apply_probe("web", "http://a:1", false);
        let status = checker.status("http://a:1");
        assert_eq!(status.consecutive_successes, 0);
        assert_eq!(status.consecutive_failures, 1);

        checker.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_start_is_noop() {
        let mut cfg = config(30);
        cfg.enabled = false;
        let checker = HealthChecker::new(cfg, Arc::new(MetricsCollector::disabled()));
        checker.start(&[upstream(&["http://a:1"])]);

        assert!(checker.snapshot().is_empty());
        assert!(checker.is_healthy("http://a:1"));
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_awaits_probers() {
        let checker = checker();
        checker.start(&[upstream(&["http://a:1", "http://b:2", "http://c:3"])]);
        checker.stop().await;
        assert!(checker.handles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probes_real_backend() {
        use axum::routing::get;
        use axum::Router;

        // a mock backend whose /health flips to 500 after three hits
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let hits = hits2.clone();
                async move {
                    if hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 3 {
                        axum::http::StatusCode::OK
                    } else {
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let cfg = HealthConfig {
            enabled: true,
            interval_secs: 30, // overridden below by a tight prober loop
            timeout_secs: 1,
            path: "/health".into(),
            unhealthy_threshold: 2,
            healthy_threshold: 2,
        };
        let checker = HealthChecker::new(cfg, Arc::new(MetricsCollector::disabled()));
        let url = format!("http://{}", addr);
        checker.start(&[upstream(&[url.as_str()])]);

        // drive probes directly rather than waiting for the interval
        for _ in 0..3 {
            let good = checker.inner.probe(&url).await;
            checker.apply_probe("web", &url, good);
        }
        assert!(checker.is_healthy(&url));

        for _ in 0..2 {
            let good = checker.inner.probe(&url).await;
            checker.apply_probe("web", &url, good);
        }
        assert!(!checker.is_healthy(&url));

        checker.stop().await;
    }
}
