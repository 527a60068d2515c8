//! # Metrics
//!
//! Two recording paths, both lock-free on the request path.
//!
//! ## Prometheus
//!
//! Counters, gauges and histograms go through the `metrics` facade into a global
//! `metrics-exporter-prometheus` recorder and are rendered by `GET /metrics`.
//!
//! ## In-memory summary
//!
//! A handful of atomic counters plus a per-source cost table back `GET /data/stats`.
//! They answer "how many hits, misses and fallbacks" and "what did upstream calls cost versus
//! what the cache saved" without scraping Prometheus.
//!
//! ## Label interning
//!
//! Endpoint and source ids are interned to `&'static str` the first time they are seen. The
//! set is bounded by the number of configured endpoints and sources.

use crate::{
    middleware::validation::ValidationError,
    proxy::errors::ProxyError,
    upstream::{circuit_breaker::CircuitBreakerState, errors::UpstreamError},
};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

// Endpoint and source ids are exposed as metric labels. Restrict /metrics to an internal
// network if ids carry anything sensitive.
static LABEL_POOL: OnceLock<DashMap<String, &'static str>> = OnceLock::new();

#[inline]
fn label_to_static(label: &str) -> Cow<'static, str> {
    let pool = LABEL_POOL.get_or_init(DashMap::new);

    if let Some(interned) = pool.get(label) {
        return Cow::Borrowed(*interned);
    }

    let owned = label.to_string();
    let leaked: &'static str = Box::leak(owned.clone().into_boxed_str());
    pool.insert(owned, leaked);
    Cow::Borrowed(leaked)
}

#[inline]
fn source_label(source_id: Option<&str>) -> Cow<'static, str> {
    source_id.map_or(Cow::Borrowed(UNMANAGED_SOURCE), label_to_static)
}

/// Label used for requests that matched no configured source.
pub const UNMANAGED_SOURCE: &str = "unmanaged";

pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for CircuitBreakerState {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 0.5,
        }
    }
}

impl MetricsState for UpstreamError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ServerError(_) => "server_error",
            Self::ClientError(_) => "client_error",
            Self::ChallengeDetected(_) => "challenge_detected",
            Self::InvalidResponse(_) => "invalid_response",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::NoEndpoints => "no_endpoints",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ConcurrencyLimit(_) => "concurrency_limit",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Timeout |
            Self::ConcurrencyLimit(_) |
            Self::ClientError(_) |
            Self::ChallengeDetected(_) => 0.5,
            Self::ConnectionFailed(_) |
            Self::ServerError(_) |
            Self::InvalidResponse(_) |
            Self::CircuitBreakerOpen |
            Self::NoEndpoints |
            Self::InvalidRequest(_) => 1.0,
        }
    }
}

impl MetricsState for ValidationError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::EmptyUrl => "empty_url",
            Self::UrlTooLong(_) => "url_too_long",
            Self::InvalidUrl(_) => "invalid_url",
            Self::UnsupportedScheme(_) => "unsupported_scheme",
            Self::RelativeUrlWithoutSource(_) => "relative_url_without_source",
            Self::UnknownSource(_) => "unknown_source",
            Self::InactiveSource(_) => "inactive_source",
            Self::UrlOutsideSource(_) => "url_outside_source",
            Self::InvalidHeader(_) => "invalid_header",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        0.5
    }
}

impl MetricsState for ProxyError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::KillSwitchActive { .. } => "kill_switch",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::Upstream(_) => "upstream_error",
            Self::AllCircuitsOpen { .. } => "all_circuits_open",
            Self::Internal(_) => "internal_error",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Validation(_) |
            Self::KillSwitchActive { .. } |
            Self::RateLimitExceeded { .. } => 0.5,
            Self::Upstream(_) | Self::AllCircuitsOpen { .. } | Self::Internal(_) => 1.0,
        }
    }
}

/// How a fetch was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Hit,
    Miss,
    Stale,
    Mock,
    Error,
}

impl FetchOutcome {
    #[must_use]
    pub fn as_metric_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Stale => "stale",
            Self::Mock => "mock",
            Self::Error => "error",
        }
    }
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install Prometheus recorder, using an unregistered fallback"
                );
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    mock: AtomicU64,
    errors: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
    rate_limit_rejections: AtomicU64,
    kill_switch_rejections: AtomicU64,
    validation_failures: AtomicU64,
}

#[derive(Debug, Default)]
struct SourceCost {
    upstream_calls: u64,
    cache_hits: u64,
    spend: f64,
    saved: f64,
}

/// Cost figures for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCostSummary {
    pub upstream_calls: u64,
    pub cache_hits: u64,
    /// `cost_per_request` times upstream calls.
    pub spend: f64,
    /// `cost_per_request` times cache hits.
    pub saved: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stale_served: u64,
    pub mock_served: u64,
    pub errors: u64,
    pub cache_hit_rate: f64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub rate_limit_rejections: u64,
    pub kill_switch_rejections: u64,
    pub validation_failures: u64,
    pub total_spend: f64,
    pub total_saved: f64,
    pub cost_by_source: BTreeMap<String, SourceCostSummary>,
}

pub struct MetricsCollector {
    counters: OutcomeCounters,
    costs: DashMap<String, SourceCost>,
    prometheus_handle: PrometheusHandle,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: OutcomeCounters::default(),
            costs: DashMap::new(),
            prometheus_handle: init_prometheus_recorder(),
        }
    }

    /// Record how a fetch was answered.
    pub fn record_outcome(&self, source_id: Option<&str>, outcome: FetchOutcome) {
        let counter = match outcome {
            FetchOutcome::Hit => &self.counters.hits,
            FetchOutcome::Miss => &self.counters.misses,
            FetchOutcome::Stale => &self.counters.stale,
            FetchOutcome::Mock => &self.counters.mock,
            FetchOutcome::Error => &self.counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        counter!(
            "relay_requests_total",
            "source" => source_label(source_id),
            "outcome" => outcome.as_metric_str()
        )
        .increment(1);
    }

    /// Record a cache hit and the upstream cost it avoided.
    pub fn record_cache_hit(&self, source_id: Option<&str>, cost_per_request: f64) {
        self.record_outcome(source_id, FetchOutcome::Hit);
        if let Some(source_id) = source_id {
            let mut cost = self.costs.entry(source_id.to_string()).or_default();
            cost.cache_hits += 1;
            cost.saved += cost_per_request;
        }
    }

    /// Record one successful upstream exchange that produced the response, and its cost.
    pub fn record_upstream_call(&self, source_id: Option<&str>, cost_per_request: f64) {
        self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        counter!("relay_upstream_calls_total", "source" => source_label(source_id)).increment(1);
        if let Some(source_id) = source_id {
            let mut cost = self.costs.entry(source_id.to_string()).or_default();
            cost.upstream_calls += 1;
            cost.spend += cost_per_request;
        }
    }

    /// Record a single attempt against an endpoint.
    pub fn record_upstream_attempt(&self, endpoint_id: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        counter!(
            "relay_upstream_attempts_total",
            "endpoint" => label_to_static(endpoint_id),
            "result" => result
        )
        .increment(1);
    }

    /// Record end-to-end pipeline latency for a fetch.
    pub fn record_fetch_duration(&self, outcome: FetchOutcome, latency_ms: u64) {
        #[allow(clippy::cast_precision_loss)]
        histogram!("relay_fetch_duration_seconds", "outcome" => outcome.as_metric_str())
            .record(latency_ms as f64 / 1000.0);
    }

    /// Record a failed attempt with its error type.
    pub fn record_upstream_error(&self, endpoint_id: &str, error: &UpstreamError) {
        self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
        let endpoint = label_to_static(endpoint_id);
        counter!(
            "relay_upstream_errors_total",
            "endpoint" => endpoint.clone(),
            "error_type" => error.as_metric_str()
        )
        .increment(1);
        gauge!("relay_upstream_error_severity", "endpoint" => endpoint)
            .set(error.as_gauge_value());
    }

    pub fn record_rate_limit_rejection(&self, source_id: &str) {
        self.counters.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
        counter!("relay_rate_limit_rejected_total", "source" => label_to_static(source_id))
            .increment(1);
    }

    pub fn record_kill_switch_rejection(&self, source_id: Option<&str>) {
        self.counters.kill_switch_rejections.fetch_add(1, Ordering::Relaxed);
        counter!("relay_kill_switch_rejected_total", "source" => source_label(source_id))
            .increment(1);
    }

    pub fn record_validation_error(&self, error: &ValidationError) {
        self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
        counter!("relay_validation_errors_total", "error_type" => error.as_metric_str())
            .increment(1);
    }

    /// Record a terminal pipeline error with type breakdown.
    pub fn record_proxy_error(&self, source_id: Option<&str>, error: &ProxyError) {
        counter!(
            "relay_proxy_errors_total",
            "source" => source_label(source_id),
            "error_type" => error.as_metric_str()
        )
        .increment(1);
        if error.as_gauge_value() >= 1.0 {
            counter!("relay_proxy_critical_errors_total").increment(1);
        }
    }

    /// Record an endpoint's breaker state.
    pub fn record_circuit_breaker_state(
        &self,
        endpoint_id: &str,
        state: CircuitBreakerState,
        failure_count: u32,
    ) {
        let endpoint = label_to_static(endpoint_id);
        gauge!("relay_circuit_breaker_state", "endpoint" => endpoint.clone())
            .set(state.as_gauge_value());
        gauge!("relay_circuit_breaker_failure_count", "endpoint" => endpoint)
            .set(f64::from(failure_count));
    }

    /// Record cache size gauges.
    pub fn record_cache_stats(&self, entries: usize, expired: usize, size_bytes: usize) {
        #[allow(clippy::cast_precision_loss)]
        {
            gauge!("relay_cache_entries").set(entries as f64);
            gauge!("relay_cache_expired_entries").set(expired as f64);
            gauge!("relay_cache_size_bytes").set(size_bytes as f64);
        }
    }

    pub fn record_cache_write(&self, source_id: Option<&str>, stored: bool) {
        let result = if stored { "stored" } else { "skipped" };
        counter!(
            "relay_cache_writes_total",
            "source" => source_label(source_id),
            "result" => result
        )
            .increment(1);
    }

    pub fn record_cache_purge(&self, scope: &str, removed: usize) {
        counter!("relay_cache_purged_entries_total", "scope" => scope.to_string())
            .increment(removed as u64);
    }

    pub fn record_rate_limit_windows(&self, active: usize, pruned: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("relay_rate_limit_windows").set(active as f64);
        if pruned > 0 {
            counter!("relay_rate_limit_windows_pruned_total").increment(pruned as u64);
        }
    }

    pub fn record_coalesced_wait(&self, served_from_cache: bool) {
        let result = if served_from_cache { "deduplicated" } else { "refetched" };
        counter!("relay_coalesced_requests_total", "result" => result).increment(1);
    }

    /// Prometheus exposition text.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let cache_hits = load(&self.counters.hits);
        let cache_misses = load(&self.counters.misses);
        let stale_served = load(&self.counters.stale);
        let mock_served = load(&self.counters.mock);
        let errors = load(&self.counters.errors);
        let total_requests = cache_hits + cache_misses + stale_served + mock_served + errors;
        let cache_hit_rate =
            if total_requests > 0 { cache_hits as f64 / total_requests as f64 } else { 0.0 };

        let cost_by_source: BTreeMap<String, SourceCostSummary> = self
            .costs
            .iter()
            .map(|entry| {
                let cost = entry.value();
                (
                    entry.key().clone(),
                    SourceCostSummary {
                        upstream_calls: cost.upstream_calls,
                        cache_hits: cost.cache_hits,
                        spend: cost.spend,
                        saved: cost.saved,
                    },
                )
            })
            .collect();

        MetricsSummary {
            total_requests,
            cache_hits,
            cache_misses,
            stale_served,
            mock_served,
            errors,
            cache_hit_rate,
            upstream_calls: load(&self.counters.upstream_calls),
            upstream_failures: load(&self.counters.upstream_failures),
            rate_limit_rejections: load(&self.counters.rate_limit_rejections),
            kill_switch_rejections: load(&self.counters.kill_switch_rejections),
            validation_failures: load(&self.counters.validation_failures),
            total_spend: cost_by_source.values().map(|c| c.spend).sum(),
            total_saved: cost_by_source.values().map(|c| c.saved).sum(),
            cost_by_source,
        }
    }
}
