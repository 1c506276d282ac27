//! Metric primitives and the Prometheus text exposition.
//!
//! Counters and gauges are plain atomics; labeled families keep their
//! series in a `HashMap` behind an `RwLock`, so the hot path is one map
//! read plus one atomic increment. No lock is held across I/O.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Histogram bucket upper bounds, in seconds.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // saturating: a stray decrement must not wrap to u64::MAX
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter family with a fixed set of label names.
#[derive(Debug)]
pub struct LabeledCounter {
    label_names: &'static [&'static str],
    series: RwLock<HashMap<Vec<String>, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, labels: &[&str]) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        if let Some(counter) = self
            .series
            .read()
            .expect("counter lock poisoned")
            .get(&labels.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let counter = self
            .series
            .write()
            .expect("counter lock poisoned")
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .read()
            .expect("counter lock poisoned")
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(Vec<String>, u64)> {
        let mut out: Vec<_> = self
            .series
            .read()
            .expect("counter lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        out.sort();
        out
    }
}

/// A gauge family with a fixed set of label names.
#[derive(Debug)]
pub struct LabeledGauge {
    label_names: &'static [&'static str],
    series: RwLock<HashMap<Vec<String>, u64>>,
}

impl LabeledGauge {
    fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, labels: &[&str], value: u64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .write()
            .expect("gauge lock poisoned")
            .insert(key, value);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .read()
            .expect("gauge lock poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(Vec<String>, u64)> {
        let mut out: Vec<_> = self
            .series
            .read()
            .expect("gauge lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        out
    }
}

#[derive(Debug)]
struct HistogramSeries {
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl HistogramSeries {
    fn new(buckets: usize) -> Self {
        Self {
            bucket_counts: (0..buckets).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        for (i, le) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *le {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}

/// A histogram family with a fixed set of label names and the shared
/// duration bucket ladder.
#[derive(Debug)]
pub struct LabeledHistogram {
    label_names: &'static [&'static str],
    series: RwLock<HashMap<Vec<String>, Arc<HistogramSeries>>>,
}

impl LabeledHistogram {
    fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, labels: &[&str], seconds: f64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();

        if let Some(series) = self.series.read().expect("histogram lock poisoned").get(&key) {
            series.observe(seconds);
            return;
        }

        let series = self
            .series
            .write()
            .expect("histogram lock poisoned")
            .entry(key)
            .or_insert_with(|| Arc::new(HistogramSeries::new(DURATION_BUCKETS.len())))
            .clone();
        series.observe(seconds);
    }

    pub fn count(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .read()
            .expect("histogram lock poisoned")
            .get(&key)
            .map(|s| s.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(Vec<String>, Arc<HistogramSeries>)> {
        let mut out: Vec<_> = self
            .series
            .read()
            .expect("histogram lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// The registry of every metric family the load balancer exports.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub requests_total: LabeledCounter,
    pub request_duration: LabeledHistogram,
    pub upstream_healthy: LabeledGauge,
    pub active_connections: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: LabeledCounter::new(&["upstream", "backend", "method", "status"]),
            request_duration: LabeledHistogram::new(&["upstream", "backend", "method"]),
            upstream_healthy: LabeledGauge::new(&["upstream", "backend"]),
            active_connections: Gauge::default(),
        }
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(
            "# HELP isame_lb_requests_total Total number of requests processed by the load balancer\n",
        );
        out.push_str("# TYPE isame_lb_requests_total counter\n");
        for (labels, value) in self.requests_total.snapshot() {
            let _ = writeln!(
                out,
                "isame_lb_requests_total{} {}",
                format_labels(self.requests_total.label_names, &labels),
                value
            );
        }
        out.push('\n');

        out.push_str(
            "# HELP isame_lb_request_duration_seconds Time spent processing requests in seconds\n",
        );
        out.push_str("# TYPE isame_lb_request_duration_seconds histogram\n");
        for (labels, series) in self.request_duration.snapshot() {
            for (i, le) in DURATION_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "isame_lb_request_duration_seconds_bucket{} {}",
                    format_labels_with_le(self.request_duration.label_names, &labels, &le.to_string()),
                    series.bucket_counts[i].load(Ordering::Relaxed)
                );
            }
            let count = series.count.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "isame_lb_request_duration_seconds_bucket{} {}",
                format_labels_with_le(self.request_duration.label_names, &labels, "+Inf"),
                count
            );
            let _ = writeln!(
                out,
                "isame_lb_request_duration_seconds_sum{} {}",
                format_labels(self.request_duration.label_names, &labels),
                series.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
            );
            let _ = writeln!(
                out,
                "isame_lb_request_duration_seconds_count{} {}",
                format_labels(self.request_duration.label_names, &labels),
                count
            );
        }
        out.push('\n');

        out.push_str(
            "# HELP isame_lb_upstream_healthy Whether upstream backend is healthy (1 = healthy, 0 = unhealthy)\n",
        );
        out.push_str("# TYPE isame_lb_upstream_healthy gauge\n");
        for (labels, value) in self.upstream_healthy.snapshot() {
            let _ = writeln!(
                out,
                "isame_lb_upstream_healthy{} {}",
                format_labels(self.upstream_healthy.label_names, &labels),
                value
            );
        }
        out.push('\n');

        out.push_str("# HELP isame_lb_active_connections Current number of active connections\n");
        out.push_str("# TYPE isame_lb_active_connections gauge\n");
        let _ = writeln!(
            out,
            "isame_lb_active_connections {}",
            self.active_connections.get()
        );

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn format_labels(names: &[&str], values: &[String]) -> String {
    let pairs: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{}=\"{}\"", n, escape_label(v)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn format_labels_with_le(names: &[&str], values: &[String], le: &str) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{}=\"{}\"", n, escape_label(v)))
        .collect();
    pairs.push(format!("le=\"{}\"", le));
    format!("{{{}}}", pairs.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
