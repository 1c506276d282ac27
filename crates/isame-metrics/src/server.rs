//! Side-car HTTP server exposing the metrics registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use isame_common::{LbError, MetricsConfig, Result};

use crate::collector::MetricsCollector;

/// The metrics endpoint, served on its own port next to the front door.
pub struct MetricsServer {
    config: MetricsConfig,
    collector: Arc<MetricsCollector>,
}

impl MetricsServer {
    pub fn new(config: MetricsConfig, collector: Arc<MetricsCollector>) -> Self {
        Self { config, collector }
    }

    /// Serve `GET <path>` (text exposition) and `GET /health` until the
    /// shutdown signal fires. A no-op when metrics are disabled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            info!("metrics collector disabled");
            return Ok(());
        }

        let app = Router::new()
            .route(&self.config.path, get(exposition))
            .route("/health", get(health))
            .with_state(self.collector);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LbError::Config(format!("failed to bind metrics port {}: {}", addr, e)))?;

        info!(
            addr = %listener.local_addr()?,
            path = %self.config.path,
            "metrics server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        info!("metrics server stopped");
        Ok(())
    }
}

async fn exposition(State(collector): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        collector.render(),
    )
}

async fn health() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], r#"{"status":"ok"}"#)
}
