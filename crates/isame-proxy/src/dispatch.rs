//! The request dispatch pipeline.
//!
//! Per request: admit through the upstream's rate limiter, snapshot the
//! health map, then run the retrier around single attempts. Each attempt
//! selects a backend, consults the circuit breaker, forwards the request
//! with the standard forwarding headers, and classifies the outcome
//! (transport error or 5xx is a failure, everything else a success).
//!
//! The attempt that produces an acceptable response head is the commit
//! point: its body streams straight through to the client and no retry
//! happens after that. The inbound body is buffered once, capped, so
//! attempts can be replayed.
//!
//! Requests route to the first configured upstream; there is no host- or
//! path-based upstream selection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, HeaderName, Request, Response, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use tracing::{debug, warn};

use isame_common::{Config, LbError, Result, Upstream};
use isame_metrics::MetricsCollector;

use crate::balancer::{HealthSnapshot, Policy};
use crate::breaker::CircuitBreaker;
use crate::health::HealthChecker;
use crate::rate_limit::RateLimiter;
use crate::retry::Retrier;

/// Cap on the buffered inbound request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The dispatcher composes the balancing policies, health map, circuit
/// breaker, retrier and rate limiters around the proxy forward.
pub struct Dispatcher {
    config: Arc<Config>,
    policies: HashMap<String, Arc<Policy>>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    health: Arc<HealthChecker>,
    breaker: Arc<CircuitBreaker>,
    retrier: Retrier,
    metrics: Arc<MetricsCollector>,
    client: reqwest::Client,
}

struct ProxiedResponse {
    backend_url: String,
    response: reqwest::Response,
    track: ConnTrack,
}

/// Scoped least-connections accounting; a no-op for policies that do not
/// track connections. Dropping it releases the slot.
struct ConnTrack {
    policy: Arc<Policy>,
    url: String,
}

impl ConnTrack {
    fn new(policy: Arc<Policy>, url: &str) -> Self {
        policy.increment(url);
        Self {
            policy,
            url: url.to_string(),
        }
    }
}

impl Drop for ConnTrack {
    fn drop(&mut self) {
        self.policy.decrement(&self.url);
    }
}

/// Holds the active-connections gauge up until dropped.
struct ActiveGuard {
    metrics: Arc<MetricsCollector>,
}

impl ActiveGuard {
    fn new(metrics: Arc<MetricsCollector>) -> Self {
        metrics.inc_active_connections();
        Self { metrics }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
    }
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        health: Arc<HealthChecker>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let mut policies = HashMap::new();
        let mut limiters = HashMap::new();

        for upstream in &config.upstreams {
            let policy = Policy::for_algorithm(&upstream.algorithm).map_err(|_| {
                LbError::Config(format!(
                    "upstream {:?}: invalid algorithm {:?}",
                    upstream.name, upstream.algorithm
                ))
            })?;
            policies.insert(upstream.name.clone(), Arc::new(policy));

            if let Some(rate_limit) = &upstream.rate_limit {
                limiters.insert(upstream.name.clone(), Arc::new(RateLimiter::new(rate_limit)));
            }
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // redirects pass through to the client untouched
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| LbError::Config(format!("failed to build backend client: {}", e)))?;

        Ok(Self {
            breaker: Arc::new(CircuitBreaker::new(&config.circuit_breaker)),
            retrier: Retrier::new(&config.retry),
            config,
            policies,
            limiters,
            health,
            metrics,
            client,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self, upstream: &str) -> Option<&Arc<Policy>> {
        self.policies.get(upstream)
    }

    pub fn limiter(&self, upstream: &str) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(upstream)
    }

    /// Sweep every rate limiter's idle clients.
    pub fn sweep_limiters(&self) {
        for limiter in self.limiters.values() {
            limiter.sweep();
        }
    }

    /// Proxy one client request end to end.
    pub async fn handle(
        &self,
        req: Request<Body>,
        client_addr: SocketAddr,
        via_tls: bool,
    ) -> Response<Body> {
        let start = Instant::now();
        let guard = ActiveGuard::new(self.metrics.clone());
        let method = req.method().clone();

        let Some(upstream) = self.config.upstreams.first() else {
            // nothing to label a metrics event with
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No upstreams configured");
        };

        let client_ip = client_identifier(req.headers(), client_addr);

        if let Some(limiter) = self.limiters.get(&upstream.name) {
            if !limiter.allow(&client_ip) {
                debug!(client = %client_ip, upstream = %upstream.name, "rate limited");
                self.metrics.record_request(
                    &upstream.name,
                    "error",
                    method.as_str(),
                    429,
                    start.elapsed(),
                );
                return error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            }
        }

        let (parts, body) = req.into_parts();
        let body = match buffer_body(body).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let status = match err {
                    LbError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                self.metrics.record_request(
                    &upstream.name,
                    "error",
                    method.as_str(),
                    status.as_u16(),
                    start.elapsed(),
                );
                return error_response(status, &err.to_string());
            }
        };

        let policy = self
            .policies
            .get(&upstream.name)
            .expect("a policy exists for every configured upstream");
        let health = self.health.snapshot();

        let outcome = self
            .retrier
            .run(|_attempt| self.attempt(upstream, policy, &parts, &body, &health, &client_ip, via_tls))
            .await;

        match outcome {
            Ok(proxied) => {
                self.metrics.record_request(
                    &upstream.name,
                    &proxied.backend_url,
                    method.as_str(),
                    proxied.response.status().as_u16(),
                    start.elapsed(),
                );
                stream_response(proxied, guard)
            }
            Err(err) => {
                warn!(upstream = %upstream.name, error = %err, "request failed");
                self.metrics.record_request(
                    &upstream.name,
                    "error",
                    method.as_str(),
                    503,
                    start.elapsed(),
                );
                error_response(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable")
            }
        }
    }

    /// One attempt: select, gate on the breaker, forward, classify.
    async fn attempt(
        &self,
        upstream: &Upstream,
        policy: &Arc<Policy>,
        parts: &Parts,
        body: &Bytes,
        health: &HealthSnapshot,
        client_ip: &str,
        via_tls: bool,
    ) -> Result<ProxiedResponse> {
        let backend = policy.select_backend(&upstream.backends, health)?;

        if !self.breaker.can_attempt(&backend.url) {
            debug!(backend = %backend.url, "circuit breaker open, skipping");
            return Err(LbError::CircuitOpen(backend.url));
        }

        let track = ConnTrack::new(policy.clone(), &backend.url);

        let response = self.forward(&backend.url, parts, body, client_ip, via_tls).await;

        match response {
            Err(err) => {
                self.breaker.record_failure(&backend.url);
                Err(err)
            }
            Ok(response) if response.status().as_u16() >= 500 => {
                self.breaker.record_failure(&backend.url);
                Err(LbError::BackendStatus(response.status().as_u16()))
            }
            Ok(response) => {
                // 4xx means the backend is fine and the client was not
                self.breaker.record_success(&backend.url);
                Ok(ProxiedResponse {
                    backend_url: backend.url,
                    response,
                    track,
                })
            }
        }
    }

    async fn forward(
        &self,
        backend_url: &str,
        parts: &Parts,
        body: &Bytes,
        client_ip: &str,
        via_tls: bool,
    ) -> Result<reqwest::Response> {
        let target = join_target(backend_url, parts);

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        set_header(&mut headers, "x-forwarded-for", client_ip);
        set_header(
            &mut headers,
            "x-forwarded-proto",
            if via_tls { "https" } else { "http" },
        );
        if let Some(host) = parts.headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            set_header(&mut headers, "x-forwarded-host", host);
        }
        set_header(&mut headers, "x-load-balancer", &self.config.service);

        self.client
            .request(parts.method.clone(), &target)
            .headers(headers)
            .body(body.clone())
            .send()
            .await
            .map_err(|e| LbError::BackendTransport(e.to_string()))
    }
}

/// Client identity for forwarding and rate limiting: incoming
/// X-Forwarded-For, else X-Real-IP, else the TCP peer address.
pub fn client_identifier(headers: &HeaderMap, client_addr: SocketAddr) -> String {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value.to_string();
        }
    }
    if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value.to_string();
        }
    }
    client_addr.ip().to_string()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn join_target(backend_url: &str, parts: &Parts) -> String {
    let base = backend_url.trim_end_matches('/');
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", base, path_and_query)
}

async fn buffer_body(body: Body) -> Result<Bytes> {
    let limited = http_body_util::Limited::new(body, MAX_BODY_BYTES);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) => {
            if err.is::<http_body_util::LengthLimitError>() {
                Err(LbError::PayloadTooLarge(MAX_BODY_BYTES))
            } else {
                Err(LbError::BackendTransport(format!(
                    "failed to read request body: {}",
                    err
                )))
            }
        }
    }
}

/// Bridge the committed backend response into the client response,
/// keeping the accounting guards alive until the body finishes.
fn stream_response(proxied: ProxiedResponse, guard: ActiveGuard) -> Response<Body> {
    let status = proxied.response.status();
    let headers = proxied.response.headers().clone();
    let track = proxied.track;

    let stream = proxied.response.bytes_stream().inspect(move |_| {
        let _ = (&guard, &track);
    });

    let mut out = Response::new(Body::from_stream(stream));
    *out.status_mut() = status;
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        out.headers_mut().append(name.clone(), value.clone());
    }
    out
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": message,
        "code": status.as_u16(),
    });

    let mut out = Response::new(Body::from(body.to_string()));
    *out.status_mut() = status;
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    out
}
