//! `/storage-pools`: shared cache namespaces, their entries and their member sources.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relay_core::cache::{
    CachePage, CacheQuery, CacheScope, CacheStats, NewStoragePool, PoolDeletion,
    PoolDeletionReport, PoolSummary, StoragePoolUpdate,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{JsonBody, QueryParams};
use crate::api::{audit, ApiError, ApiState, ClientAddr};

fn summary(state: &ApiState, id: &str) -> Result<PoolSummary, ApiError> {
    state
        .components
        .pools()
        .summaries(state.components.registry())
        .into_iter()
        .find(|summary| summary.pool.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("storage pool '{id}' not found")))
}

/// `GET /storage-pools`
pub async fn list(State(state): State<ApiState>) -> Json<Vec<PoolSummary>> {
    Json(state.components.pools().summaries(state.components.registry()))
}

/// `POST /storage-pools`
pub async fn create(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(input): JsonBody<NewStoragePool>,
) -> Result<(StatusCode, Json<PoolSummary>), ApiError> {
    let pool = state.components.pools().create(input)?;
    audit::log_create("storage_pool", pool.id.clone(), client);
    Ok((StatusCode::CREATED, Json(summary(&state, &pool.id)?)))
}

/// `GET /storage-pools/{id}`
pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PoolSummary>, ApiError> {
    Ok(Json(summary(&state, &id)?))
}

/// `PATCH /storage-pools/{id}`
pub async fn update(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<StoragePoolUpdate>,
) -> Result<Json<PoolSummary>, ApiError> {
    let details = json!({ "name": update.name, "description": update.description });
    state.components.pools().update(&id, update)?;
    audit::log_update("storage_pool", id.clone(), client, Some(details));
    Ok(Json(summary(&state, &id)?))
}

/// Query parameters of `DELETE /storage-pools/{id}`.
///
/// Without `strategy` the pool must be empty.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub target_pool_id: Option<String>,
}

impl TryFrom<DeleteParams> for PoolDeletion {
    type Error = ApiError;

    fn try_from(params: DeleteParams) -> Result<Self, Self::Error> {
        match params.strategy.as_deref() {
            None | Some("require_empty") => Ok(Self::RequireEmpty),
            Some("purge") => Ok(Self::Purge),
            Some("reassign") => {
                let target_pool_id = params.target_pool_id.ok_or_else(|| {
                    ApiError::BadRequest("reassign requires target_pool_id".to_string())
                })?;
                Ok(Self::Reassign { target_pool_id })
            }
            Some(other) => Err(ApiError::BadRequest(format!(
                "unknown deletion strategy '{other}': expected require_empty, reassign or purge"
            ))),
        }
    }
}

/// `DELETE /storage-pools/{id}?strategy=require_empty|reassign|purge&target_pool_id=...`
pub async fn delete(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    QueryParams(params): QueryParams<DeleteParams>,
) -> Result<Json<PoolDeletionReport>, ApiError> {
    let strategy = PoolDeletion::try_from(params)?;
    let report = state.components.pools().delete(&id, strategy, state.components.registry())?;
    audit::AuditEvent::new(audit::AuditOperation::Delete, "storage_pool", id)
        .with_client_ip(client)
        .with_details(json!({
            "sources_moved": report.sources_moved,
            "entries_moved": report.entries_moved,
            "entries_purged": report.entries_purged,
        }))
        .log();
    Ok(Json(report))
}

/// `GET /storage-pools/{id}/cache`
pub async fn entries(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    QueryParams(query): QueryParams<CacheQuery>,
) -> Result<Json<CachePage>, ApiError> {
    Ok(Json(state.components.pools().entries(&id, query)?))
}

#[derive(Debug, Serialize)]
pub struct PoolPurged {
    pub pool_id: String,
    pub purged: usize,
}

/// `POST /storage-pools/{id}/purge`
pub async fn purge(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
) -> Result<Json<PoolPurged>, ApiError> {
    if !state.components.pools().exists(&id) {
        return Err(ApiError::NotFound(format!("storage pool '{id}' not found")));
    }
    let purged = state.components.orchestrator().purge(&CacheScope::Pool(id.clone()));
    audit::log_purge("storage_pool", id.clone(), client, purged);
    Ok(Json(PoolPurged { pool_id: id, purged }))
}

/// `GET /storage-pools/{id}/stats`
pub async fn stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.components.pools().stats(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct AssignSource {
    pub source_id: String,
}

#[derive(Debug, Serialize)]
pub struct MembershipChange {
    pub pool_id: String,
    pub source_id: String,
    pub entries_moved: usize,
}

/// `POST /storage-pools/{id}/sources`: moves a source and its entries into the pool.
pub async fn assign_source(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<AssignSource>,
) -> Result<Json<MembershipChange>, ApiError> {
    let entries_moved = state.components.pools().assign_source(
        &id,
        &request.source_id,
        state.components.registry(),
    )?;
    audit::log_update(
        "storage_pool",
        id.clone(),
        client,
        Some(json!({ "assigned_source": request.source_id, "entries_moved": entries_moved })),
    );
    Ok(Json(MembershipChange { pool_id: id, source_id: request.source_id, entries_moved }))
}

/// `DELETE /storage-pools/{id}/sources/{source_id}`: returns the source to dedicated storage.
pub async fn unassign_source(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path((id, source_id)): Path<(String, String)>,
) -> Result<Json<MembershipChange>, ApiError> {
    let registry = state.components.registry();
    if !state.components.pools().exists(&id) {
        return Err(ApiError::NotFound(format!("storage pool '{id}' not found")));
    }
    let member = registry.get_source(&source_id).is_some_and(|source| {
        source.pool_id.as_deref() == Some(id.as_str())
    });
    if !member {
        return Err(ApiError::NotFound(format!(
            "source '{source_id}' is not a member of storage pool '{id}'"
        )));
    }
    let entries_moved = state.components.pools().unassign_source(&source_id, registry)?;
    audit::log_update(
        "storage_pool",
        id.clone(),
        client,
        Some(json!({ "unassigned_source": source_id, "entries_moved": entries_moved })),
    );
    Ok(Json(MembershipChange { pool_id: id, source_id, entries_moved }))
}
