//! Configuration schema, loading and validation.
//!
//! Configuration is a TOML document read once at startup. Validation
//! fills in defaults for omitted tuning knobs and rejects documents that
//! cannot produce a working load balancer (no upstreams, malformed
//! backend URLs, missing TLS material).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LbError, Result};

pub const DEFAULT_SERVICE_NAME: &str = "isame-lb";

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_service() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

/// Front-door listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub https_port: u16,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_read_timeout() -> u64 {
    15
}

fn default_write_timeout() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            https_port: 0,
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// A named group of backends sharing one balancing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub name: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub backends: Vec<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_algorithm() -> String {
    "round_robin".to_string()
}

/// A single addressable HTTP(S) target. The URL is the identity key used
/// by the health checker, circuit breaker and policy state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl Backend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 1,
        }
    }

    pub fn with_weight(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight,
        }
    }
}

/// Active health checking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Side-car metrics endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Per-upstream, per-client sliding-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_ip: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-backend circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_breaker_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry-with-backoff settings for a single logical client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Front-door TLS settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub min_version: String,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            service: default_service(),
            server: ServerConfig::default(),
            upstreams: Vec::new(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LbError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            LbError::Config(format!("failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to the built-in
    /// defaults when the file does not exist.
    pub fn load_with_defaults(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Config::default());
        }
        Self::load(path)
    }

    /// Validate the configuration, filling in defaults for omitted
    /// tuning knobs. Structural problems are errors.
    pub fn validate(&mut self) -> Result<()> {
        if self.service.is_empty() {
            self.service = default_service();
        }
        if self.version.is_empty() {
            self.version = default_version();
        }

        self.validate_server()?;
        self.validate_upstreams()?;
        self.validate_health();
        self.validate_metrics();
        self.validate_circuit_breaker();
        self.validate_retry()?;
        self.validate_tls()?;

        Ok(())
    }

    fn validate_server(&mut self) -> Result<()> {
        if self.server.port == 0 {
            return Err(LbError::Config("server port must be between 1 and 65535".into()));
        }
        if self.server.read_timeout_secs == 0 {
            self.server.read_timeout_secs = default_read_timeout();
        }
        if self.server.write_timeout_secs == 0 {
            self.server.write_timeout_secs = default_write_timeout();
        }
        if self.server.idle_timeout_secs == 0 {
            self.server.idle_timeout_secs = default_idle_timeout();
        }
        if self.server.max_header_bytes == 0 {
            self.server.max_header_bytes = default_max_header_bytes();
        }
        Ok(())
    }

    fn validate_upstreams(&mut self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(LbError::Config("at least one upstream must be configured".into()));
        }

        let mut names = HashSet::new();
        for i in 0..self.upstreams.len() {
            if self.upstreams[i].name.is_empty() {
                return Err(LbError::Config(format!("upstream[{}]: name is required", i)));
            }
            if !names.insert(self.upstreams[i].name.clone()) {
                return Err(LbError::Config(format!(
                    "upstream[{}]: duplicate name {:?}",
                    i, self.upstreams[i].name
                )));
            }
            if self.upstreams[i].algorithm.is_empty() {
                self.upstreams[i].algorithm = default_algorithm();
            }
            if self.upstreams[i].backends.is_empty() {
                return Err(LbError::Config(format!(
                    "upstream[{}]: at least one backend is required",
                    i
                )));
            }

            for j in 0..self.upstreams[i].backends.len() {
                self.validate_backend(i, j)?;
            }

            if let Some(rl) = &self.upstreams[i].rate_limit {
                if rl.enabled {
                    if rl.requests_per_ip == 0 {
                        return Err(LbError::Config(format!(
                            "upstream[{}]: requests_per_ip must be greater than 0",
                            i
                        )));
                    }
                    if rl.window_ms == 0 {
                        return Err(LbError::Config(format!(
                            "upstream[{}]: window_ms must be greater than 0",
                            i
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_backend(&mut self, i: usize, j: usize) -> Result<()> {
        let url = self.upstreams[i].backends[j].url.clone();
        if url.is_empty() {
            return Err(LbError::Config(format!(
                "upstream[{}].backend[{}]: URL is required",
                i, j
            )));
        }

        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .ok_or_else(|| {
                LbError::Config(format!(
                    "upstream[{}].backend[{}]: URL scheme must be http or https ({})",
                    i, j, url
                ))
            })?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(LbError::Config(format!(
                "upstream[{}].backend[{}]: URL {} has no host",
                i, j, url
            )));
        }

        if self.upstreams[i].backends[j].weight == 0 {
            self.upstreams[i].backends[j].weight = default_weight();
        }

        Ok(())
    }

    fn validate_health(&mut self) {
        if self.health.interval_secs == 0 {
            self.health.interval_secs = default_health_interval();
        }
        if self.health.timeout_secs == 0 {
            self.health.timeout_secs = default_health_timeout();
        }
        if self.health.path.is_empty() {
            self.health.path = default_health_path();
        }
        if self.health.unhealthy_threshold == 0 {
            self.health.unhealthy_threshold = default_unhealthy_threshold();
        }
        if self.health.healthy_threshold == 0 {
            self.health.healthy_threshold = default_healthy_threshold();
        }
        if !self.health.path.starts_with('/') {
            self.health.path = format!("/{}", self.health.path);
        }
    }

    fn validate_metrics(&mut self) {
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                self.metrics.port = default_metrics_port();
            }
            if self.metrics.path.is_empty() {
                self.metrics.path = default_metrics_path();
            }
            if !self.metrics.path.starts_with('/') {
                self.metrics.path = format!("/{}", self.metrics.path);
            }
        }
    }

    fn validate_circuit_breaker(&mut self) {
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                self.circuit_breaker.failure_threshold = default_failure_threshold();
            }
            if self.circuit_breaker.timeout_secs == 0 {
                self.circuit_breaker.timeout_secs = default_breaker_timeout();
            }
        }
    }

    fn validate_retry(&mut self) -> Result<()> {
        if self.retry.enabled {
            if self.retry.max_attempts == 0 {
                self.retry.max_attempts = default_max_attempts();
            }
            if self.retry.initial_backoff_ms == 0 {
                self.retry.initial_backoff_ms = default_initial_backoff();
            }
            if self.retry.max_backoff_ms == 0 {
                self.retry.max_backoff_ms = default_max_backoff();
            }
            if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
                return Err(LbError::Config(
                    "initial_backoff_ms must be less than or equal to max_backoff_ms".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_tls(&mut self) -> Result<()> {
        if !self.tls.enabled {
            return Ok(());
        }

        if self.tls.cert_file.is_empty() {
            return Err(LbError::Config("cert_file is required when TLS is enabled".into()));
        }
        if self.tls.key_file.is_empty() {
            return Err(LbError::Config("key_file is required when TLS is enabled".into()));
        }
        if !Path::new(&self.tls.cert_file).exists() {
            return Err(LbError::Config(format!("cert_file not found: {}", self.tls.cert_file)));
        }
        if !Path::new(&self.tls.key_file).exists() {
            return Err(LbError::Config(format!("key_file not found: {}", self.tls.key_file)));
        }
        if self.server.https_port == 0 {
            self.server.https_port = 8443;
        }
        if !self.tls.min_version.is_empty()
            && self.tls.min_version != "1.2"
            && self.tls.min_version != "1.3"
        {
            return Err(LbError::Config(format!(
                "invalid min_version {:?} (supported: 1.2, 1.3)",
                self.tls.min_version
            )));
        }

        Ok(())
    }

    /// Total number of backends across all upstreams.
    pub fn backend_count(&self) -> usize {
        self.upstreams.iter().map(|u| u.backends.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.upstreams.push(Upstream {
            name: "web".into(),
            algorithm: "round_robin".into(),
            backends: vec![Backend::new("http://127.0.0.1:9001")],
            rate_limit: None,
        });
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service, "isame-lb");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.health.healthy_threshold, 2);
        assert_eq!(config.metrics.port, 9090);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_validate_minimal() {
        let mut config = minimal_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_upstream() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let mut config = minimal_config();
        config.upstreams[0].backends[0].url = "ftp://127.0.0.1:9001".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_host() {
        let mut config = minimal_config();
        config.upstreams[0].backends[0].url = "http://".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_defaults_weight() {
        let mut config = minimal_config();
        config.upstreams[0].backends[0].weight = 0;
        config.validate().unwrap();
        assert_eq!(config.upstreams[0].backends[0].weight, 1);
    }

    #[test]
    fn test_validate_defaults_algorithm() {
        let mut config = minimal_config();
        config.upstreams[0].algorithm = String::new();
        config.validate().unwrap();
        assert_eq!(config.upstreams[0].algorithm, "round_robin");
    }

    #[test]
    fn test_validate_rejects_duplicate_upstream_names() {
        let mut config = minimal_config();
        config.upstreams.push(Upstream {
            name: "web".into(),
            algorithm: "round_robin".into(),
            backends: vec![Backend::new("http://127.0.0.1:9002")],
            rate_limit: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rate_limit() {
        let mut config = minimal_config();
        config.upstreams[0].rate_limit = Some(RateLimitConfig {
            enabled: true,
            requests_per_ip: 0,
            window_ms: 1000,
        });
        assert!(config.validate().is_err());

        config.upstreams[0].rate_limit = Some(RateLimitConfig {
            enabled: true,
            requests_per_ip: 10,
            window_ms: 0,
        });
        assert!(config.validate().is_err());

        // disabled rate limits skip validation entirely
        config.upstreams[0].rate_limit = Some(RateLimitConfig {
            enabled: false,
            requests_per_ip: 0,
            window_ms: 0,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_retry_backoff_ordering() {
        let mut config = minimal_config();
        config.retry.initial_backoff_ms = 5000;
        config.retry.max_backoff_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tls_requires_files() {
        let mut config = minimal_config();
        config.tls.enabled = true;
        assert!(config.validate().is_err());

        config.tls.cert_file = "/nonexistent/cert.pem".into();
        config.tls.key_file = "/nonexistent/key.pem".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tls_defaults_https_port() {
        let mut config = minimal_config();
        let cert = tempfile::NamedTempFile::new().unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        config.tls.enabled = true;
        config.tls.cert_file = cert.path().to_string_lossy().into_owned();
        config.tls.key_file = key.path().to_string_lossy().into_owned();
        config.validate().unwrap();
        assert_eq!(config.server.https_port, 8443);
    }

    #[test]
    fn test_validate_tls_min_version() {
        let mut config = minimal_config();
        let cert = tempfile::NamedTempFile::new().unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        config.tls.enabled = true;
        config.tls.cert_file = cert.path().to_string_lossy().into_owned();
        config.tls.key_file = key.path().to_string_lossy().into_owned();
        config.tls.min_version = "1.1".into();
        assert!(config.validate().is_err());

        config.tls.min_version = "1.3".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
service = "edge"

[server]
port = 8088

[[upstreams]]
name = "api"
algorithm = "weighted_round_robin"

[[upstreams.backends]]
url = "http://127.0.0.1:9001"
weight = 3

[[upstreams.backends]]
url = "http://127.0.0.1:9002"

[upstreams.rate_limit]
enabled = true
requests_per_ip = 100
window_ms = 60000

[retry]
enabled = true
max_attempts = 5
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.service, "edge");
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].algorithm, "weighted_round_robin");
        assert_eq!(config.upstreams[0].backends[0].weight, 3);
        assert_eq!(config.upstreams[0].backends[1].weight, 1);
        assert_eq!(config.retry.max_attempts, 5);
        // omitted knobs picked up defaults
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.health.interval_secs, 30);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server = [not toml").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_with_defaults_missing_file() {
        let config = Config::load_with_defaults("/nonexistent/isame.toml").unwrap();
        assert_eq!(config.service, "isame-lb");
        assert!(config.upstreams.is_empty());
    }

    #[test]
    fn test_backend_count() {
        let mut config = minimal_config();
        config.upstreams[0]
            .backends
            .push(Backend::new("http://127.0.0.1:9002"));
        assert_eq!(config.backend_count(), 2);
    }
}
