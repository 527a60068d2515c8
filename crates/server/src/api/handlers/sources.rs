//! `/sources`: source and endpoint administration plus circuit breaker inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relay_core::{
    types::Endpoint,
    upstream::{EndpointBreaker, NewEndpoint, NewSource, SourceUpdate, SourceView},
};
use serde::Serialize;
use serde_json::json;

use super::JsonBody;
use crate::api::{audit, ApiError, ApiState, ClientAddr};

fn view(state: &ApiState, id: &str) -> Result<SourceView, ApiError> {
    state
        .components
        .registry()
        .view(id)
        .ok_or_else(|| ApiError::NotFound(format!("source '{id}' not found")))
}

/// `GET /sources`
pub async fn list(State(state): State<ApiState>) -> Json<Vec<SourceView>> {
    let registry = state.components.registry();
    let views =
        registry.list_sources().iter().filter_map(|source| registry.view(&source.id)).collect();
    Json(views)
}

/// `POST /sources`
pub async fn create(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(input): JsonBody<NewSource>,
) -> Result<(StatusCode, Json<SourceView>), ApiError> {
    let source = state.components.registry().create_source(input)?;
    audit::log_create("source", source.id.clone(), client);
    Ok((StatusCode::CREATED, Json(view(&state, &source.id)?)))
}

/// `GET /sources/{id}`
pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SourceView>, ApiError> {
    Ok(Json(view(&state, &id)?))
}

/// `PATCH /sources/{id}`
pub async fn update(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<SourceUpdate>,
) -> Result<Json<SourceView>, ApiError> {
    let details = json!({
        "name": update.name,
        "cost_per_request": update.cost_per_request,
        "is_active": update.is_active,
        "bypass_bot_detection": update.bypass_bot_detection,
        "mock_response": update.mock_response.is_some(),
        "clear_mock_response": update.clear_mock_response,
    });
    state.components.registry().update_source(&id, update)?;
    audit::log_update("source", id.clone(), client, Some(details));
    Ok(Json(view(&state, &id)?))
}

#[derive(Debug, Serialize)]
pub struct SourceDeleted {
    pub id: String,
    pub entries_removed: usize,
}

/// `DELETE /sources/{id}`: also drops the source's cache entries, policy and rate limit.
pub async fn delete(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
) -> Result<Json<SourceDeleted>, ApiError> {
    let entries_removed = state.components.orchestrator().delete_source(&id)?;
    audit::log_delete("source", id.clone(), client);
    Ok(Json(SourceDeleted { id, entries_removed }))
}

/// `POST /sources/{id}/endpoints`
pub async fn add_endpoint(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<NewEndpoint>,
) -> Result<(StatusCode, Json<Endpoint>), ApiError> {
    let mut endpoint = state.components.registry().add_endpoint(&id, input)?;
    audit::log_create("endpoint", endpoint.id.clone(), client);
    endpoint.auth = endpoint.auth.redacted();
    Ok((StatusCode::CREATED, Json(endpoint)))
}

/// `DELETE /sources/{id}/endpoints/{endpoint_id}`
pub async fn remove_endpoint(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path((id, endpoint_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.components.registry().remove_endpoint(&id, &endpoint_id)?;
    audit::log_delete("endpoint", endpoint_id, client);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sources/{id}/circuit-breakers`
pub async fn circuit_breakers(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EndpointBreaker>>, ApiError> {
    Ok(Json(state.components.registry().breakers(&id).await?))
}

/// `POST /sources/{id}/circuit-breakers/{endpoint_id}/reset`
pub async fn reset_circuit_breaker(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path((id, endpoint_id)): Path<(String, String)>,
) -> Result<Json<Vec<EndpointBreaker>>, ApiError> {
    let registry = state.components.registry();
    registry.reset_breaker(&id, &endpoint_id).await?;
    audit::log_update(
        "circuit_breaker",
        endpoint_id,
        client,
        Some(json!({ "action": "reset", "source_id": id })),
    );
    Ok(Json(registry.breakers(&id).await?))
}
