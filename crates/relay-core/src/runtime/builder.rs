//! Builder pattern for initializing the Relay runtime.

use crate::{
    cache::{CacheKeyResolver, PolicyError, PoolError},
    config::AppConfig,
    metrics::MetricsCollector,
    middleware::RateLimitError,
    proxy::{OrchestratorConfig, OrchestratorParts, RequestOrchestrator},
    upstream::{HttpClient, RegistryError},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{lifecycle::RelayRuntime, RelayComponents};

/// Errors that can occur during runtime initialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// A seeded pool, source, rate limit or cache policy was rejected.
    #[error("Invalid seed {kind} '{name}': {message}")]
    Seed { kind: &'static str, name: String, message: String },

    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
}

impl RuntimeError {
    fn seed(kind: &'static str, name: &str, error: impl std::fmt::Display) -> Self {
        Self::Seed { kind, name: name.to_string(), message: error.to_string() }
    }
}

#[derive(Clone)]
struct RuntimeOptions {
    enable_maintenance: bool,
    shutdown_channel_capacity: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { enable_maintenance: true, shutdown_channel_capacity: 16, metrics: None }
    }
}

/// Builder for constructing a [`RelayRuntime`].
///
/// # Examples
///
/// ```no_run
/// # use relay_core::{config::AppConfig, runtime::RelayRuntimeBuilder};
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = RelayRuntimeBuilder::new()
///     .with_config(AppConfig::load()?)
///     .disable_maintenance()
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RelayRuntimeBuilder {
    config: Option<AppConfig>,
    options: RuntimeOptions,
}

impl RelayRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { config: None, options: RuntimeOptions::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shares an existing collector instead of creating one.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.options.metrics = Some(metrics);
        self
    }

    /// Skips the background loop that prunes rate-limit windows and publishes gauges.
    #[must_use]
    pub fn disable_maintenance(mut self) -> Self {
        self.options.enable_maintenance = false;
        self
    }

    /// Sets custom shutdown channel capacity (default: 16).
    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    /// Builds the runtime, seeds configured state and starts the maintenance loop.
    ///
    /// Must be called from within a Tokio runtime when maintenance is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if the configuration is missing or invalid, the HTTP client
    /// cannot be built, or any seed entry fails validation.
    pub fn build(self) -> Result<RelayRuntime, RuntimeError> {
        let config = self.config.ok_or_else(|| {
            RuntimeError::ConfigValidation("No configuration provided".to_string())
        })?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;

        info!(
            environment = %config.environment,
            sources = config.sources.len(),
            pools = config.pools.len(),
            maintenance_enabled = self.options.enable_maintenance,
            "Initializing Relay runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);

        let metrics = self.options.metrics.unwrap_or_else(|| Arc::new(MetricsCollector::new()));
        let http_client = Arc::new(
            HttpClient::with_config(config.http_client_config())
                .map_err(|e| RuntimeError::Initialization(format!("HTTP client: {e}")))?,
        );
        debug!(concurrency_limit = config.upstream.concurrency_limit, "HTTP client initialized");

        let parts = OrchestratorParts::new(
            http_client,
            CacheKeyResolver::new(&config.cache.key_headers),
            config.breaker_cooldown(),
            metrics,
        );
        if config.kill_switch.enabled {
            parts.kill_switch.set_global(true);
        }
        seed(&parts, &config)?;

        let orchestrator_config = OrchestratorConfig {
            default_ttl_seconds: config.cache.default_ttl_seconds,
            coalesce_requests: config.cache.coalesce_requests,
            unmanaged_timeout: Duration::from_millis(config.upstream.default_timeout_ms),
            retry: config.retry_policy(),
        };
        let orchestrator = Arc::new(RequestOrchestrator::new(parts, orchestrator_config));
        debug!("Request orchestrator initialized");

        let runtime = RelayRuntime::new(
            RelayComponents::new(orchestrator),
            shutdown_tx,
            config,
            self.options.enable_maintenance,
        );

        info!("Relay runtime initialization complete");
        Ok(runtime)
    }
}

impl Default for RelayRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes configured pools, sources, rate limits and cache policies, in that order.
fn seed(parts: &OrchestratorParts, config: &AppConfig) -> Result<(), RuntimeError> {
    for pool in &config.pools {
        let name = pool.id.clone().unwrap_or_else(|| pool.name.clone());
        parts
            .pools
            .create(pool.clone())
            .map_err(|e: PoolError| RuntimeError::seed("pool", &name, e))?;
    }

    for source in &config.sources {
        let name = source.id.clone().unwrap_or_else(|| source.name.clone());
        parts
            .registry
            .create_source(source.clone())
            .map_err(|e: RegistryError| RuntimeError::seed("source", &name, e))?;
    }

    for rule in &config.rate_limits {
        if parts.registry.get_source(&rule.source_id).is_none() {
            let missing = RegistryError::SourceNotFound(rule.source_id.clone());
            return Err(RuntimeError::seed("rate limit", &rule.source_id, missing));
        }
        parts
            .rate_limiter
            .create_rule(rule.clone())
            .map_err(|e: RateLimitError| RuntimeError::seed("rate limit", &rule.source_id, e))?;
    }

    for policy in &config.cache_policies {
        if parts.registry.get_source(&policy.source_id).is_none() {
            let missing = RegistryError::SourceNotFound(policy.source_id.clone());
            return Err(RuntimeError::seed("cache policy", &policy.source_id, missing));
        }
        parts
            .policies
            .create(policy.clone())
            .map_err(|e: PolicyError| RuntimeError::seed("cache policy", &policy.source_id, e))?;
    }

    info!(
        pools = config.pools.len(),
        sources = config.sources.len(),
        rate_limits = config.rate_limits.len(),
        cache_policies = config.cache_policies.len(),
        "seed data loaded"
    );
    Ok(())
}
