//! The front-door server.
//!
//! Wires the dispatcher, health checker and metrics side-car together,
//! exposes the `/health` and `/status` introspection endpoints, and
//! proxies everything else. Plain HTTP is served with axum directly;
//! HTTPS runs its own accept loop so the TLS handshake happens before
//! hyper sees the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info};

use isame_common::{Config, LbError, Result};
use isame_metrics::{MetricsCollector, MetricsServer};

use crate::dispatch::Dispatcher;
use crate::health::HealthChecker;
use crate::tls;

/// Interval between rate-limiter sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Marker extension present on requests that arrived over TLS.
#[derive(Clone, Copy)]
struct TlsSession;

struct AppState {
    config: Arc<Config>,
    health: Arc<HealthChecker>,
    dispatcher: Arc<Dispatcher>,
}

/// The assembled load balancer.
pub struct LbServer {
    config: Arc<Config>,
    health: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl LbServer {
    /// Build every component from validated configuration. TLS material
    /// is loaded and validated here, so a bad certificate fails startup.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsCollector::new(config.metrics.enabled));
        let health = Arc::new(HealthChecker::new(config.health.clone(), metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), health.clone(), metrics.clone())?);

        let tls_acceptor = if config.tls.enabled {
            Some(tls::build_acceptor(&config.tls)?)
        } else {
            None
        };

        Ok(Self {
            config,
            health,
            metrics,
            dispatcher,
            tls_acceptor,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The front-door router: introspection endpoints plus the proxy
    /// fallback.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            health: self.health.clone(),
            dispatcher: self.dispatcher.clone(),
        });

        Router::new()
            .route("/health", get(health_endpoint))
            .route("/status", get(status_endpoint))
            .fallback(proxy_endpoint)
            .with_state(state)
    }

    /// Run until SIGINT or SIGTERM, then shut everything down in order:
    /// listeners first, then the health checker, then the metrics
    /// side-car.
    pub async fn run(self) -> Result<()> {
        info!(
            service = %self.config.service,
            version = %self.config.version,
            upstreams = self.config.upstreams.len(),
            "starting load balancer"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let metrics_server = MetricsServer::new(self.config.metrics.clone(), self.metrics.clone());
        let metrics_task = tokio::spawn(metrics_server.run(shutdown_rx.clone()));

        self.health.start(&self.config.upstreams);

        let sweeper_task = {
            let dispatcher = self.dispatcher.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = interval.tick() => dispatcher.sweep_limiters(),
                    }
                }
            })
        };

        let app = self.router();

        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            LbError::Config(format!("failed to bind HTTP port {}: {}", http_addr, e))
        })?;
        info!(addr = %http_addr, "HTTP server listening");

        let http_task = {
            let app = app.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                axum::serve(
                    http_listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
            })
        };

        let https_task = match &self.tls_acceptor {
            Some(acceptor) => {
                let https_addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.https_port));
                let https_listener = TcpListener::bind(https_addr).await.map_err(|e| {
                    LbError::Config(format!("failed to bind HTTPS port {}: {}", https_addr, e))
                })?;
                info!(addr = %https_addr, "HTTPS server listening");

                Some(tokio::spawn(serve_tls(
                    https_listener,
                    acceptor.clone(),
                    app,
                    shutdown_rx.clone(),
                )))
            }
            None => None,
        };

        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);

        let _ = http_task.await;
        if let Some(task) = https_task {
            let _ = task.await;
        }
        self.health.stop().await;
        let _ = sweeper_task.await;
        if let Ok(result) = metrics_task.await {
            result?;
        }

        info!("load balancer shut down complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Accept loop for the HTTPS listener. Each connection completes the
/// handshake, then serves the shared router with the peer address and a
/// TLS marker injected into request extensions.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                debug!(error = %err, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(peer = %peer_addr, error = %err, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
                req.extensions_mut().insert(ConnectInfo(peer_addr));
                req.extensions_mut().insert(TlsSession);
                let app = app.clone();
                async move { app.oneshot(req.map(Body::new)).await }
            });

            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(peer = %peer_addr, error = %err, "connection error");
            }
        });
    }
}

async fn health_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.config.service,
    }))
}

async fn status_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = state.health.snapshot();

    let mut total = 0usize;
    let mut healthy = 0usize;
    for upstream in &state.config.upstreams {
        for backend in &upstream.backends {
            total += 1;
            if statuses.get(&backend.url).copied().unwrap_or(false) {
                healthy += 1;
            }
        }
    }

    Json(serde_json::json!({
        "service": state.config.service,
        "version": state.config.version,
        "upstreams": state.config.upstreams.len(),
        "backends": {
            "total": total,
            "healthy": healthy,
            "unhealthy": total - healthy,
        },
        "health_checks_enabled": state.config.health.enabled,
        "metrics_enabled": state.config.metrics.enabled,
    }))
}

async fn proxy_endpoint(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let via_tls = req.extensions().get::<TlsSession>().is_some();
    state.dispatcher.handle(req, client_addr, via_tls).await
}
