//! The fetch-or-serve pipeline.
//!
//! [`RequestOrchestrator::fetch`] composes every gate and store in a fixed order:
//!
//! 1. validate the request and resolve its source
//! 2. kill switch
//! 3. cache lookup (skipped by `force_refresh`)
//! 4. per-key coalescing, then a second lookup
//! 5. rate limit
//! 6. failover across the source's candidate endpoints
//! 7. cache policy, then the cache write
//! 8. on exhaustion, the primary endpoint's fallback mode
//!
//! Admin operations that touch more than one component (deleting a source, purging, toggling
//! kill switches) also live here so that they emit the same events and metrics.

use bytes::Bytes;
use reqwest::Method;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    cache::{
        BulkUpdateReport, CacheDecision, CacheKeyResolver, CacheScope, CacheStore, CacheWrite,
        InflightMap, PolicyEnforcer, StoragePoolManager,
    },
    events::{EventBus, GatewayEvent},
    metrics::{FetchOutcome, MetricsCollector},
    middleware::{
        kill_switch::{KillSwitch, KillSwitchStatus},
        rate_limiting::RateLimiter,
        validation::ValidationError,
    },
    types::{
        CacheEntry, FallbackMode, FetchMeta, FetchRequest, FetchResult, Source, UpstreamResponse,
    },
    upstream::{
        endpoint::{join_url, UpstreamCall},
        errors::UpstreamError,
        failover::{classify, FailoverExecutor, FailoverExhausted, FailoverOptions, RetryPolicy},
        http_client::{header_map_from, HttpClient, OutboundRequest},
        registry::{RegistryError, SourceRegistry},
    },
};

use super::errors::ProxyError;

/// Pipeline settings that are not owned by any single component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// TTL applied when a request does not name one.
    pub default_ttl_seconds: u64,
    /// Serialise concurrent non-forced fetches of the same key.
    pub coalesce_requests: bool,
    /// Timeout for requests that match no source.
    pub unmanaged_timeout: std::time::Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            coalesce_requests: true,
            unmanaged_timeout: std::time::Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared components the orchestrator composes.
#[derive(Clone)]
pub struct OrchestratorParts {
    pub store: Arc<CacheStore>,
    pub registry: Arc<SourceRegistry>,
    pub pools: Arc<StoragePoolManager>,
    pub policies: Arc<PolicyEnforcer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub kill_switch: Arc<KillSwitch>,
    pub http_client: Arc<HttpClient>,
    pub key_resolver: CacheKeyResolver,
    pub metrics: Arc<MetricsCollector>,
    pub events: EventBus,
}

impl OrchestratorParts {
    /// Fresh, empty components sharing one HTTP client.
    #[must_use]
    pub fn new(
        http_client: Arc<HttpClient>,
        key_resolver: CacheKeyResolver,
        breaker_cooldown: std::time::Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let store = Arc::new(CacheStore::new());
        let pools = Arc::new(StoragePoolManager::new(store.clone()));
        let registry =
            Arc::new(SourceRegistry::new(http_client.clone(), pools.clone(), breaker_cooldown));
        Self {
            store,
            registry,
            pools,
            policies: Arc::new(PolicyEnforcer::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            kill_switch: Arc::new(KillSwitch::default()),
            http_client,
            key_resolver,
            metrics,
            events: EventBus::default(),
        }
    }
}

/// Where a request goes: a managed source and the path below its endpoints, or a raw URL.
struct Target {
    source: Option<Source>,
    /// Path and query re-rooted onto each endpoint. Empty for unmanaged requests.
    suffix: String,
    /// URL that identifies the request independently of the endpoint that serves it.
    logical_url: String,
}

impl Target {
    fn managed(source: Source, suffix: String) -> Self {
        let logical_url = join_url(&format!("source://{}", source.id), &suffix);
        Self { source: Some(source), suffix, logical_url }
    }

    fn unmanaged(url: &str) -> Self {
        Self { source: None, suffix: String::new(), logical_url: url.to_string() }
    }

    fn source_id(&self) -> Option<&str> {
        self.source.as_ref().map(|source| source.id.as_str())
    }

    fn scope(&self) -> CacheScope {
        self.source
            .as_ref()
            .map_or(CacheScope::Dedicated { source_id: None }, Source::cache_scope)
    }

    fn cost(&self) -> f64 {
        self.source.as_ref().map_or(0.0, |source| source.cost_per_request)
    }
}

/// A fetched response before it is written to the cache.
struct Fetched {
    response: UpstreamResponse,
    endpoint_id: Option<String>,
    request_url: String,
    fallback: bool,
}

pub struct RequestOrchestrator {
    parts: OrchestratorParts,
    inflight: InflightMap,
    failover: FailoverExecutor,
    config: OrchestratorConfig,
}

impl RequestOrchestrator {
    #[must_use]
    pub fn new(parts: OrchestratorParts, config: OrchestratorConfig) -> Self {
        let failover = FailoverExecutor::new(config.retry);
        Self { parts, inflight: InflightMap::new(), failover, config }
    }

    /// Serves a logical request from the cache or an upstream.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Validation`] for a malformed request or unknown source
    /// - [`ProxyError::KillSwitchActive`] when the global or source switch is on
    /// - [`ProxyError::RateLimitExceeded`] when the source's window is full
    /// - [`ProxyError::AllCircuitsOpen`] / [`ProxyError::Upstream`] when every endpoint failed
    ///   and the fallback mode had nothing to serve
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResult, ProxyError> {
        let started = Instant::now();
        let result = self.run_pipeline(&request).await;

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = match &result {
            Ok(result) if result.meta.stale => FetchOutcome::Stale,
            Ok(result) if result.meta.is_mock => FetchOutcome::Mock,
            Ok(result) if result.cached => FetchOutcome::Hit,
            Ok(_) => FetchOutcome::Miss,
            Err(_) => FetchOutcome::Error,
        };
        self.parts.metrics.record_fetch_duration(outcome, latency_ms);
        result
    }

    async fn run_pipeline(&self, request: &FetchRequest) -> Result<FetchResult, ProxyError> {
        let metrics = &self.parts.metrics;

        let target = request.validate().and_then(|()| self.resolve_target(request)).map_err(|e| {
            metrics.record_validation_error(&e);
            debug!(url = %request.url, error = %e, "request rejected by validation");
            ProxyError::from(e)
        })?;
        let source_id = target.source_id();

        if let Err(scope) = self.parts.kill_switch.check(source_id) {
            metrics.record_kill_switch_rejection(source_id);
            self.reject(source_id, "kill_switch");
            return Err(self.fail(source_id, ProxyError::KillSwitchActive { scope }));
        }

        let method = request.method.trim().to_ascii_uppercase();
        let body = request.body_text();
        let cache_key = self.parts.key_resolver.resolve(
            &method,
            &target.logical_url,
            body.as_deref(),
            request.headers.as_ref(),
        );
        let scope = target.scope();

        if !request.force_refresh {
            if let Some(entry) = self.parts.store.lookup(&cache_key, &scope) {
                return Ok(self.serve_hit(&target, cache_key, entry));
            }
        }

        let coalesce = self.config.coalesce_requests &&
            !request.force_refresh &&
            !self.parts.policies.is_no_cache(source_id);
        let _inflight = if coalesce {
            let guard = self.inflight.acquire(&cache_key).await;
            if let Some(entry) = self.parts.store.lookup(&cache_key, &scope) {
                metrics.record_coalesced_wait(true);
                return Ok(self.serve_hit(&target, cache_key, entry));
            }
            // The leader stored nothing; later waiters must not queue behind this fetch.
            if guard.waited() {
                metrics.record_coalesced_wait(false);
                None
            } else {
                Some(guard)
            }
        } else {
            None
        };

        if let Some(source_id) = source_id {
            if let Err(exceeded) = self.parts.rate_limiter.check(source_id) {
                metrics.record_rate_limit_rejection(source_id);
                self.reject(Some(source_id), "rate_limit");
                return Err(self.fail(
                    Some(source_id),
                    ProxyError::RateLimitExceeded {
                        source_id: source_id.to_string(),
                        retry_after_secs: exceeded.retry_after_secs,
                    },
                ));
            }
        }

        debug!(
            source = source_id.unwrap_or("-"),
            cache_key = %cache_key,
            force_refresh = request.force_refresh,
            "cache miss, fetching upstream"
        );

        let upstream_method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Internal(format!("invalid method: {e}")))?;
        let call = UpstreamCall {
            method: upstream_method,
            suffix: target.suffix.clone(),
            headers: request.headers.clone().unwrap_or_default(),
            body: body.map(Bytes::from),
        };

        let fetched = match &target.source {
            Some(source) => match self.fetch_managed(source, &call, request.strict).await {
                Ok(fetched) => fetched,
                Err(exhausted) => {
                    return self.apply_fallback(&target, source, cache_key, &scope, exhausted).await;
                }
            },
            None => self.fetch_unmanaged(&target, &call, request.strict).await.map_err(|e| {
                self.fail(None, ProxyError::Upstream(e))
            })?,
        };

        metrics.record_upstream_call(source_id, target.cost());
        Ok(self.store_result(&target, request, &method, cache_key, &scope, fetched))
    }

    fn resolve_target(&self, request: &FetchRequest) -> Result<Target, ValidationError> {
        let url = request.url.trim();
        let registry = &self.parts.registry;

        let Some(name) = request.source.as_deref() else {
            return match registry.match_url(url) {
                Some((source, _)) if !source.is_active => {
                    Err(ValidationError::InactiveSource(source.id))
                }
                Some((source, suffix)) => Ok(Target::managed(source, suffix)),
                None => Ok(Target::unmanaged(url)),
            };
        };

        let source =
            registry.find_source(name).ok_or_else(|| ValidationError::UnknownSource(name.into()))?;
        if !source.is_active {
            return Err(ValidationError::InactiveSource(source.id));
        }

        let suffix = if url.starts_with('/') {
            url.to_string()
        } else {
            registry
                .match_source_url(&source.id, url)
                .ok_or_else(|| ValidationError::UrlOutsideSource(source.id.clone()))?
        };
        Ok(Target::managed(source, suffix))
    }

    async fn fetch_managed(
        &self,
        source: &Source,
        call: &UpstreamCall,
        strict: bool,
    ) -> Result<Fetched, FailoverExhausted> {
        let endpoints = self.parts.registry.resolve_endpoints(&source.id).await;
        let options = FailoverOptions { strict, bypass_bot_detection: source.bypass_bot_detection };

        let outcome = self.failover.execute(&endpoints, call, options).await;
        let attempts = match &outcome {
            Ok(success) => &success.attempts,
            Err(exhausted) => &exhausted.attempts,
        };
        let metrics = &self.parts.metrics;
        for attempt in attempts {
            metrics.record_upstream_attempt(&attempt.endpoint_id, attempt.error.is_none());
            if let Some(error) = &attempt.error {
                metrics.record_upstream_error(&attempt.endpoint_id, error);
            }
        }
        self.publish_breaker_states(&endpoints).await;

        let success = outcome?;
        let request_url = endpoints.get(success.position).map_or_else(String::new, |endpoint| {
            join_url(&endpoint.config().base_url, &call.suffix)
        });
        if success.position > 0 {
            info!(
                source = %source.id,
                endpoint = %success.endpoint_id,
                position = success.position,
                "served by fallback endpoint"
            );
        }

        Ok(Fetched {
            response: success.response,
            endpoint_id: Some(success.endpoint_id),
            request_url,
            fallback: success.position > 0,
        })
    }

    async fn fetch_unmanaged(
        &self,
        target: &Target,
        call: &UpstreamCall,
        strict: bool,
    ) -> Result<Fetched, UpstreamError> {
        let response = self
            .parts
            .http_client
            .send(OutboundRequest {
                method: call.method.clone(),
                url: target.logical_url.clone(),
                headers: header_map_from(&call.headers),
                body: call.body.clone(),
                timeout: self.config.unmanaged_timeout,
            })
            .await?;
        let response = classify(response, strict)?;

        Ok(Fetched {
            response,
            endpoint_id: None,
            request_url: target.logical_url.clone(),
            fallback: false,
        })
    }

    fn store_result(
        &self,
        target: &Target,
        request: &FetchRequest,
        method: &str,
        cache_key: String,
        scope: &CacheScope,
        fetched: Fetched,
    ) -> FetchResult {
        let source_id = target.source_id();
        let requested_ttl = request.ttl.unwrap_or(self.config.default_ttl_seconds);
        let decision = self.parts.policies.decide(source_id, requested_ttl);

        let mut meta = match decision {
            CacheDecision::Store { ttl_seconds } => {
                let entry = self.parts.store.put(
                    &cache_key,
                    CacheWrite {
                        source_id: source_id.map(str::to_string),
                        request_method: method.to_string(),
                        request_url: fetched.request_url,
                        response: fetched.response.clone(),
                        ttl_seconds,
                    },
                    scope,
                );
                meta_from_entry(&entry, target.source.as_ref())
            }
            CacheDecision::Skip => FetchMeta {
                source_id: source_id.map(str::to_string),
                source_name: target.source.as_ref().map(|source| source.name.clone()),
                no_cache: true,
                ..FetchMeta::default()
            },
        };
        let stored = matches!(decision, CacheDecision::Store { .. });
        meta.endpoint_id = fetched.endpoint_id.clone();
        meta.fallback = fetched.fallback;

        self.parts.metrics.record_cache_write(source_id, stored);
        self.parts.metrics.record_outcome(source_id, FetchOutcome::Miss);
        self.parts.events.publish(GatewayEvent::UpstreamFetched {
            source_id: source_id.map(str::to_string),
            endpoint_id: fetched.endpoint_id,
            cache_key: cache_key.clone(),
            status: fetched.response.status,
            stored,
        });

        FetchResult { cached: false, cache_key, response: fetched.response, meta }
    }

    async fn apply_fallback(
        &self,
        target: &Target,
        source: &Source,
        cache_key: String,
        scope: &CacheScope,
        exhausted: FailoverExhausted,
    ) -> Result<FetchResult, ProxyError> {
        match self.parts.registry.fallback_mode(&source.id) {
            FallbackMode::Stale => {
                if let Some(entry) = self.parts.store.peek(&cache_key, scope) {
                    warn!(source = %source.id, cache_key = %cache_key, "serving stale entry");
                    self.parts.metrics.record_outcome(Some(&source.id), FetchOutcome::Stale);
                    self.parts.events.publish(GatewayEvent::FallbackServed {
                        source_id: source.id.clone(),
                        cache_key: cache_key.clone(),
                        mode: FallbackMode::Stale.as_str(),
                    });
                    let mut meta = meta_from_entry(&entry, Some(source));
                    meta.stale = true;
                    meta.fallback = true;
                    let response = entry.response;
                    return Ok(FetchResult { cached: true, cache_key, response, meta });
                }
            }
            FallbackMode::Mock => {
                if let Some(mock) = source.mock_response.clone() {
                    warn!(source = %source.id, cache_key = %cache_key, "serving mock payload");
                    self.parts.metrics.record_outcome(Some(&source.id), FetchOutcome::Mock);
                    self.parts.events.publish(GatewayEvent::FallbackServed {
                        source_id: source.id.clone(),
                        cache_key: cache_key.clone(),
                        mode: FallbackMode::Mock.as_str(),
                    });
                    let meta = FetchMeta {
                        source_id: Some(source.id.clone()),
                        source_name: Some(source.name.clone()),
                        is_mock: true,
                        fallback: true,
                        ..FetchMeta::default()
                    };
                    return Ok(FetchResult { cached: false, cache_key, response: mock, meta });
                }
            }
            FallbackMode::None => {}
        }

        let error = if exhausted.all_circuits_open() && self.has_active_endpoints(&source.id) {
            ProxyError::AllCircuitsOpen { source_id: source.id.clone() }
        } else {
            ProxyError::Upstream(exhausted.last_error.unwrap_or(UpstreamError::NoEndpoints))
        };
        warn!(
            source = %source.id,
            cache_key = %cache_key,
            attempts = exhausted.attempts.len(),
            error = %error,
            "upstream exhausted"
        );
        Err(self.fail(target.source_id(), error))
    }

    fn serve_hit(&self, target: &Target, cache_key: String, entry: CacheEntry) -> FetchResult {
        debug!(
            source = target.source_id().unwrap_or("-"),
            cache_key = %cache_key,
            hit_count = entry.hit_count,
            "cache hit"
        );
        self.parts.metrics.record_cache_hit(target.source_id(), target.cost());
        let meta = meta_from_entry(&entry, target.source.as_ref());
        FetchResult { cached: true, cache_key, response: entry.response, meta }
    }

    fn has_active_endpoints(&self, source_id: &str) -> bool {
        self.parts.registry.endpoints_for(source_id).iter().any(|e| e.config().is_active)
    }

    async fn publish_breaker_states(&self, endpoints: &[Arc<crate::upstream::UpstreamEndpoint>]) {
        for endpoint in endpoints {
            let snapshot = endpoint.breaker_snapshot().await;
            self.parts.metrics.record_circuit_breaker_state(
                endpoint.id(),
                snapshot.state,
                snapshot.failure_count,
            );
        }
    }

    fn reject(&self, source_id: Option<&str>, reason: &'static str) {
        self.parts.events.publish(GatewayEvent::RequestRejected {
            source_id: source_id.map(str::to_string),
            reason,
        });
    }

    fn fail(&self, source_id: Option<&str>, error: ProxyError) -> ProxyError {
        self.parts.metrics.record_outcome(source_id, FetchOutcome::Error);
        self.parts.metrics.record_proxy_error(source_id, &error);
        error
    }

    // Admin operations spanning several components.

    /// Deletes a source and everything keyed by it: cached entries, policy, rate limit rule and
    /// kill switch. Returns the number of cache entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotFound`] for an unknown source.
    pub fn delete_source(&self, source_id: &str) -> Result<usize, RegistryError> {
        self.parts.registry.delete_source(source_id)?;
        let removed = self
            .parts
            .store
            .remove_where(|entry| entry.source_id.as_deref() == Some(source_id));
        self.parts.policies.remove_for_source(source_id);
        self.parts.rate_limiter.remove_for_source(source_id);
        self.parts.kill_switch.set_source(source_id, false);
        info!(source = %source_id, entries_removed = removed, "source deleted");
        Ok(removed)
    }

    /// Sets the global switch, or a source's switch when `source_id` is given.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotFound`] if `source_id` names no source.
    pub fn set_kill_switch(
        &self,
        source_id: Option<&str>,
        enabled: bool,
    ) -> Result<KillSwitchStatus, RegistryError> {
        match source_id {
            Some(id) => {
                if self.parts.registry.get_source(id).is_none() {
                    return Err(RegistryError::SourceNotFound(id.to_string()));
                }
                self.parts.kill_switch.set_source(id, enabled);
            }
            None => {
                self.parts.kill_switch.set_global(enabled);
            }
        }
        self.parts.events.publish(GatewayEvent::KillSwitchChanged {
            source_id: source_id.map(str::to_string),
            enabled,
        });
        Ok(self.parts.kill_switch.snapshot())
    }

    /// Removes one entry by key.
    pub fn invalidate(&self, cache_key: &str) -> Option<CacheEntry> {
        let removed = self.parts.store.invalidate(cache_key);
        if removed.is_some() {
            debug!(cache_key = %cache_key, "cache entry invalidated");
            self.parts
                .events
                .publish(GatewayEvent::CacheInvalidated { cache_key: cache_key.to_string() });
        }
        removed
    }

    /// Removes several entries by key, reporting each key's outcome.
    pub fn invalidate_many(&self, cache_keys: &[String]) -> Vec<(String, bool)> {
        let outcomes = self.parts.store.invalidate_many(cache_keys);
        for (cache_key, removed) in &outcomes {
            if *removed {
                self.parts
                    .events
                    .publish(GatewayEvent::CacheInvalidated { cache_key: cache_key.clone() });
            }
        }
        outcomes
    }

    /// Deletes every entry in `scope`.
    pub fn purge(&self, scope: &CacheScope) -> usize {
        let removed = self.parts.store.purge(scope);
        let label = match scope {
            CacheScope::All => "all".to_string(),
            CacheScope::Pool(pool_id) => format!("pool:{pool_id}"),
            CacheScope::Dedicated { source_id } => {
                format!("dedicated:{}", source_id.as_deref().unwrap_or("unmanaged"))
            }
        };
        info!(scope = %label, removed, "cache purged");
        self.parts.metrics.record_cache_purge(&label, removed);
        self.parts.events.publish(GatewayEvent::CachePurged { scope: label, removed });
        removed
    }

    pub fn bulk_update_ttl(&self, entry_ids: &[u64], ttl_seconds: u64) -> BulkUpdateReport {
        let report = self.parts.store.bulk_update_ttl(entry_ids, ttl_seconds);
        info!(
            requested = entry_ids.len(),
            entries_updated = report.entries_updated,
            ttl_seconds,
            "bulk ttl update"
        );
        self.parts.events.publish(GatewayEvent::CacheTtlUpdated {
            entries_updated: report.entries_updated,
            ttl_seconds,
        });
        report
    }

    /// Runs the purge effect of every cache policy.
    pub fn cleanup_policies(&self) -> BTreeMap<String, usize> {
        let removed = self.parts.policies.cleanup(&self.parts.store);
        let total: usize = removed.values().sum();
        info!(removed = total, sources = removed.len(), "cache policy cleanup");
        self.parts.events.publish(GatewayEvent::PolicyCleanup { removed: total });
        removed
    }

    #[must_use]
    pub fn parts(&self) -> &OrchestratorParts {
        &self.parts
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Keys with a coalesced fetch currently in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

fn meta_from_entry(entry: &CacheEntry, source: Option<&Source>) -> FetchMeta {
    FetchMeta {
        hit_count: entry.hit_count,
        ttl_seconds: entry.ttl_seconds,
        created_at: Some(entry.created_at),
        expires_at: entry.expires_at,
        last_hit_at: entry.last_hit_at,
        source_id: entry.source_id.clone(),
        source_name: source.map(|source| source.name.clone()),
        ..FetchMeta::default()
    }
}
