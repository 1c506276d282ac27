//! Recording facade over the metrics registry.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::MetricsRegistry;

/// The handle the rest of the system records metrics through.
///
/// Cloning is cheap; all clones share one registry. When metrics are
/// disabled every recording operation is a no-op and the registry stays
/// empty.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    enabled: bool,
    registry: Arc<MetricsRegistry>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record the final outcome of one proxied request.
    pub fn record_request(
        &self,
        upstream: &str,
        backend: &str,
        method: &str,
        status: u16,
        duration: Duration,
    ) {
        if !self.enabled {
            return;
        }
        let status = status.to_string();
        self.registry
            .requests_total
            .inc(&[upstream, backend, method, &status]);
        self.registry
            .request_duration
            .observe(&[upstream, backend, method], duration.as_secs_f64());
    }

    pub fn set_backend_health(&self, upstream: &str, backend: &str, healthy: bool) {
        if !self.enabled {
            return;
        }
        self.registry
            .upstream_healthy
            .set(&[upstream, backend], healthy as u64);
    }

    pub fn inc_active_connections(&self) {
        if self.enabled {
            self.registry.active_connections.inc();
        }
    }

    pub fn dec_active_connections(&self) {
        if self.enabled {
            self.registry.active_connections.dec();
        }
    }

    pub fn render(&self) -> String {
        self.registry.render()
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }
}
