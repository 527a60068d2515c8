//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `set_default` calls
//! 2. **Config file**: TOML file named by the `RELAY_CONFIG` env var (`config/config.toml`)
//! 3. **Environment variables**: `RELAY__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: HTTP server settings (bind address, concurrency, body limit)
//! - [`UpstreamSettings`]: outbound HTTP client, breaker cool-down and retry backoff
//! - [`CacheConfig`]: default TTL, key header allow-list, coalescing, maintenance interval
//! - [`LoggingConfig`]: log level and format
//! - [`MetricsConfig`]: Prometheus exposition
//! - [`KillSwitchConfig`]: initial global kill switch
//! - Seed data: `pools`, `sources`, `rate_limits` and `cache_policies`
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind_port = 3030
//!
//! [[pools]]
//! id = "weather"
//! name = "Weather providers"
//!
//! [[sources]]
//! id = "forecast"
//! name = "Forecast API"
//! storage_mode = "shared"
//! pool_id = "weather"
//! cost_per_request = 0.002
//!
//! [[sources.endpoints]]
//! base_url = "https://api.forecast.example.com/v2"
//! priority = 0
//! fallback_mode = "stale"
//!
//! [[sources.endpoints]]
//! base_url = "https://backup.forecast.example.com/v2"
//! priority = 1
//!
//! [[rate_limits]]
//! source_id = "forecast"
//! max_requests = 100
//! window_seconds = 60
//! ```

use crate::{
    cache::{NewCachePolicy, NewStoragePool},
    middleware::rate_limiting::NewRateLimitRule,
    upstream::{
        failover::RetryPolicy,
        http_client::{HttpClientConfig, DEFAULT_MAX_RESPONSE_BYTES},
        registry::NewSource,
    },
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind the server to. Defaults to `127.0.0.1`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port number to listen on. Must be greater than 0. Defaults to `3030`.
    pub bind_port: u16,

    /// Maximum number of requests the server handles at once. Defaults to `256`.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds. Defaults to `60`.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Largest accepted request body in bytes. Defaults to 2 MiB.
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_request_timeout_seconds() -> u64 {
    60
}

fn default_body_limit_bytes() -> usize {
    2 * 1024 * 1024
}

/// Outbound HTTP and resilience settings shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Upper bound on concurrent outbound requests. Defaults to `512`.
    pub concurrency_limit: usize,

    /// Timeout for requests that match no source, in milliseconds. Defaults to `10000`.
    pub default_timeout_ms: u64,

    /// Seconds an open breaker waits before admitting a probe. Defaults to `30`.
    pub breaker_cooldown_seconds: u64,

    /// First retry delay in milliseconds. Defaults to `100`.
    pub retry_base_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds. Defaults to `2000`.
    pub retry_max_backoff_ms: u64,

    /// Largest upstream response body accepted, in bytes. Defaults to `10485760` (10 MiB).
    pub max_response_bytes: usize,

    /// `User-Agent` sent upstream.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    HttpClientConfig::default().user_agent
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used when a request does not specify one. `0` never expires. Defaults to `300`.
    pub default_ttl_seconds: u64,

    /// Request headers that take part in the cache key. Empty by default.
    #[serde(default)]
    pub key_headers: Vec<String>,

    /// Collapse concurrent identical fetches into one upstream call. Defaults to `true`.
    pub coalesce_requests: bool,

    /// Interval of the background maintenance loop. Defaults to `60`.
    pub maintenance_interval_seconds: u64,
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

/// Prometheus metrics configuration. When enabled, metrics are exposed at `/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Start with every request blocked.
    #[serde(default)]
    pub enabled: bool,
}

/// Root application configuration containing all subsystem settings.
///
/// Loaded with the `RELAY` prefix for environment overrides using `__` as a separator, e.g.
/// `RELAY__SERVER__BIND_PORT=8080`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment (e.g., "development", "production").
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub kill_switch: KillSwitchConfig,

    /// Storage pools created at startup, before any source.
    #[serde(default)]
    pub pools: Vec<NewStoragePool>,

    /// Sources created at startup, each with its endpoints.
    #[serde(default)]
    pub sources: Vec<NewSource>,

    #[serde(default)]
    pub rate_limits: Vec<NewRateLimitRule>,

    #[serde(default)]
    pub cache_policies: Vec<NewCachePolicy>,
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: 3030,
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_seconds: default_request_timeout_seconds(),
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 512,
            default_timeout_ms: 10_000,
            breaker_cooldown_seconds: 30,
            retry_base_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            key_headers: Vec::new(),
            coalesce_requests: true,
            maintenance_interval_seconds: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            upstream: UpstreamSettings::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            pools: Vec::new(),
            sources: Vec::new(),
            rate_limits: Vec::new(),
            cache_policies: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment variables still apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("environment", "development")?
            .set_default("server.bind_address", "127.0.0.1")?
            .set_default("server.bind_port", 3030)?
            .set_default("upstream.concurrency_limit", 512)?
            .set_default("upstream.default_timeout_ms", 10_000)?
            .set_default("upstream.breaker_cooldown_seconds", 30)?
            .set_default("upstream.retry_base_backoff_ms", 100)?
            .set_default("upstream.retry_max_backoff_ms", 2_000)?
            .set_default("upstream.max_response_bytes", DEFAULT_MAX_RESPONSE_BYTES as u64)?
            .set_default("cache.default_ttl_seconds", 300)?
            .set_default("cache.coalesce_requests", true)?
            .set_default("cache.maintenance_interval_seconds", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("metrics.enabled", true)?
            .add_source(File::from(config_path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cache.key_headers")
                    .try_parsing(true),
            )
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml`, or the path in `RELAY_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Returns the parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed into a valid [`SocketAddr`].
    ///
    /// [`SocketAddr`]: std::net::SocketAddr
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid socket address: {}:{}",
                    self.server.bind_address, self.server.bind_port
                )
            })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    #[must_use]
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.upstream.breaker_cooldown_seconds)
    }

    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.cache.maintenance_interval_seconds)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(self.upstream.retry_base_backoff_ms),
            max_backoff: Duration::from_millis(self.upstream.retry_max_backoff_ms),
        }
    }

    #[must_use]
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            concurrent_limit: self.upstream.concurrency_limit,
            max_response_bytes: self.upstream.max_response_bytes,
            user_agent: self.upstream.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// Seed data is validated later, when it is written through the same paths as the admin
    /// API.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_port == 0 {
            return Err("Bind port must be greater than 0".to_string());
        }

        if self.server.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }

        if self.server.body_limit_bytes == 0 {
            return Err("Body limit must be greater than 0".to_string());
        }

        if self.upstream.concurrency_limit == 0 {
            return Err("Upstream concurrency limit must be greater than 0".to_string());
        }

        if self.upstream.default_timeout_ms == 0 {
            return Err("Upstream default timeout must be greater than 0".to_string());
        }

        if self.upstream.max_response_bytes == 0 {
            return Err("Upstream max response size must be greater than 0".to_string());
        }

        if self.upstream.retry_base_backoff_ms > self.upstream.retry_max_backoff_ms {
            return Err(format!(
                "Retry base backoff ({}ms) exceeds max backoff ({}ms)",
                self.upstream.retry_base_backoff_ms, self.upstream.retry_max_backoff_ms
            ));
        }

        if self.cache.maintenance_interval_seconds == 0 {
            return Err("Maintenance interval must be greater than 0".to_string());
        }

        if self.cache.key_headers.iter().any(|header| header.trim().is_empty()) {
            return Err("Cache key headers must not be empty".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
