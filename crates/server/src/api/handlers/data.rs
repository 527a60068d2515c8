//! `/data`: the fetch pipeline and cache administration.

use axum::{extract::State, Json};
use relay_core::{
    cache::{BulkUpdateReport, CachePage, CacheQuery, CacheScope, CacheStats},
    metrics::MetricsSummary,
    middleware::KillSwitchStatus,
    types::{FetchRequest, FetchResult},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{JsonBody, QueryParams};
use crate::api::{audit, ApiError, ApiState, ClientAddr};

/// `POST /data`
pub async fn fetch(
    State(state): State<ApiState>,
    JsonBody(request): JsonBody<FetchRequest>,
) -> Result<Json<FetchResult>, ApiError> {
    debug!(method = %request.method, url = %request.url, "fetch requested");
    let result = state.components.orchestrator().fetch(request).await?;
    Ok(Json(result))
}

/// `GET /data/cache`
pub async fn list_cache(
    State(state): State<ApiState>,
    QueryParams(query): QueryParams<CacheQuery>,
) -> Json<CachePage> {
    Json(state.components.cache_store().query(&query))
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    pub entry_ids: Vec<u64>,
    pub ttl_seconds: u64,
}

/// `PATCH /data/cache/bulk-update`
pub async fn bulk_update_ttl(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(request): JsonBody<BulkUpdateRequest>,
) -> Result<Json<BulkUpdateReport>, ApiError> {
    if request.entry_ids.is_empty() {
        return Err(ApiError::BadRequest("entry_ids must not be empty".to_string()));
    }
    let report =
        state.components.orchestrator().bulk_update_ttl(&request.entry_ids, request.ttl_seconds);
    audit::log_update(
        "cache_entry",
        format!("{} entries", request.entry_ids.len()),
        client,
        Some(json!({
            "ttl_seconds": request.ttl_seconds,
            "entries_updated": report.entries_updated,
        })),
    );
    Ok(Json(report))
}

/// Either a single key or a batch.
#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub cache_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateOutcome {
    pub cache_key: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
    pub results: Vec<InvalidateOutcome>,
}

/// `DELETE /data/cache`
///
/// A single `cache_key` that matches nothing is a 404; a batch reports per-key outcomes.
pub async fn invalidate(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(request): JsonBody<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let orchestrator = state.components.orchestrator();

    if request.cache_keys.is_empty() {
        let Some(cache_key) = request.cache_key else {
            return Err(ApiError::BadRequest("cache_key or cache_keys is required".to_string()));
        };
        if orchestrator.invalidate(&cache_key).is_none() {
            return Err(ApiError::NotFound(format!("cache entry '{cache_key}' not found")));
        }
        audit::log_delete("cache_entry", cache_key.clone(), client);
        return Ok(Json(InvalidateResponse {
            removed: 1,
            results: vec![InvalidateOutcome { cache_key, removed: true }],
        }));
    }

    let mut keys = request.cache_keys;
    keys.extend(request.cache_key);
    let results: Vec<InvalidateOutcome> = orchestrator
        .invalidate_many(&keys)
        .into_iter()
        .map(|(cache_key, removed)| InvalidateOutcome { cache_key, removed })
        .collect();
    let removed = results.iter().filter(|outcome| outcome.removed).count();
    audit::log_purge("cache_entry", format!("{} keys", keys.len()), client, removed);
    Ok(Json(InvalidateResponse { removed, results }))
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

/// `POST /data/cache/purge`
pub async fn purge(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(request): JsonBody<PurgeRequest>,
) -> Result<Json<PurgeResponse>, ApiError> {
    if !request.confirm {
        return Err(ApiError::BadRequest("purging the cache requires confirm: true".to_string()));
    }
    let purged = state.components.orchestrator().purge(&CacheScope::All);
    audit::log_purge("cache", "all", client, purged);
    Ok(Json(PurgeResponse { purged }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub requests: MetricsSummary,
    pub inflight_requests: usize,
    pub kill_switch: KillSwitchStatus,
}

/// `GET /data/stats`
pub async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let components = &state.components;
    Json(StatsResponse {
        cache: components.cache_store().stats(&CacheScope::All),
        requests: components.metrics_collector().snapshot(),
        inflight_requests: components.orchestrator().inflight_count(),
        kill_switch: components.kill_switch().snapshot(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(default)]
    pub pool_id: Option<String>,
}

/// `GET /data/cache/analytics`, optionally narrowed to one storage pool.
pub async fn analytics(
    State(state): State<ApiState>,
    QueryParams(query): QueryParams<AnalyticsQuery>,
) -> Result<Json<CacheStats>, ApiError> {
    let scope = match query.pool_id {
        Some(pool_id) => {
            if !state.components.pools().exists(&pool_id) {
                return Err(ApiError::NotFound(format!("storage pool '{pool_id}' not found")));
            }
            CacheScope::Pool(pool_id)
        }
        None => CacheScope::All,
    };
    Ok(Json(state.components.cache_store().stats(&scope)))
}
