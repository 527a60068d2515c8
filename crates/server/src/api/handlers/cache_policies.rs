//! `/cache-policies`: per-source TTL caps, caching disablement and cleanup.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relay_core::{
    cache::{CachePolicyUpdate, NewCachePolicy},
    types::CachePolicy,
};
use serde::Serialize;
use serde_json::json;

use super::JsonBody;
use crate::api::{audit, ApiError, ApiState, ClientAddr};

/// `GET /cache-policies`
pub async fn list(State(state): State<ApiState>) -> Json<Vec<CachePolicy>> {
    Json(state.components.policies().list())
}

/// `POST /cache-policies`
pub async fn create(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(input): JsonBody<NewCachePolicy>,
) -> Result<(StatusCode, Json<CachePolicy>), ApiError> {
    if state.components.registry().get_source(&input.source_id).is_none() {
        return Err(ApiError::NotFound(format!("source '{}' not found", input.source_id)));
    }
    let policy = state.components.policies().create(input)?;
    audit::log_create("cache_policy", policy.id.clone(), client);
    Ok((StatusCode::CREATED, Json(policy)))
}

/// `GET /cache-policies/{id}`
pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CachePolicy>, ApiError> {
    state
        .components
        .policies()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("cache policy '{id}' not found")))
}

/// `PATCH /cache-policies/{id}`
pub async fn update(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<CachePolicyUpdate>,
) -> Result<Json<CachePolicy>, ApiError> {
    let details = json!({
        "max_ttl_seconds": update.max_ttl_seconds,
        "no_cache": update.no_cache,
        "purge_schedule": update.purge_schedule,
    });
    let policy = state.components.policies().update(&id, update)?;
    audit::log_update("cache_policy", id, client, Some(details));
    Ok(Json(policy))
}

/// `DELETE /cache-policies/{id}`
pub async fn delete(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.components.policies().delete(&id)?;
    audit::log_delete("cache_policy", id, client);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
    pub by_source: BTreeMap<String, usize>,
}

/// `POST /cache-policies/cleanup`
pub async fn cleanup(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
) -> Json<CleanupResponse> {
    let by_source = state.components.orchestrator().cleanup_policies();
    let removed = by_source.values().sum();
    audit::log_purge("cache_policy", "cleanup", client, removed);
    Json(CleanupResponse { removed, by_source })
}
