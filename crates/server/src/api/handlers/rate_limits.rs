//! `/rate-limits`: per-source fixed-window rules.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relay_core::{
    middleware::{NewRateLimitRule, RateLimitRuleUpdate, WindowUsage},
    types::RateLimitRule,
};
use serde::Serialize;
use serde_json::json;

use super::JsonBody;
use crate::api::{audit, ApiError, ApiState, ClientAddr};

fn rule(state: &ApiState, id: &str) -> Result<RateLimitRule, ApiError> {
    state
        .components
        .rate_limiter()
        .get_rule(id)
        .ok_or_else(|| ApiError::NotFound(format!("rate limit rule '{id}' not found")))
}

/// `GET /rate-limits`
pub async fn list(State(state): State<ApiState>) -> Json<Vec<RateLimitRule>> {
    Json(state.components.rate_limiter().list_rules())
}

/// `POST /rate-limits`
pub async fn create(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(input): JsonBody<NewRateLimitRule>,
) -> Result<(StatusCode, Json<RateLimitRule>), ApiError> {
    if state.components.registry().get_source(&input.source_id).is_none() {
        return Err(ApiError::NotFound(format!("source '{}' not found", input.source_id)));
    }
    let rule = state.components.rate_limiter().create_rule(input)?;
    audit::log_create("rate_limit", rule.id.clone(), client);
    Ok((StatusCode::CREATED, Json(rule)))
}

/// `GET /rate-limits/{id}`
pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RateLimitRule>, ApiError> {
    Ok(Json(rule(&state, &id)?))
}

/// `PATCH /rate-limits/{id}`
pub async fn update(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<RateLimitRuleUpdate>,
) -> Result<Json<RateLimitRule>, ApiError> {
    let details = json!({
        "max_requests": update.max_requests,
        "window_seconds": update.window_seconds,
        "enabled": update.enabled,
    });
    let rule = state.components.rate_limiter().update_rule(&id, update)?;
    audit::log_update("rate_limit", id, client, Some(details));
    Ok(Json(rule))
}

/// `DELETE /rate-limits/{id}`
pub async fn delete(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.components.rate_limiter().delete_rule(&id)?;
    audit::log_delete("rate_limit", id, client);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct RuleUsage {
    pub rule: RateLimitRule,
    /// `None` while no window is open.
    pub window: Option<WindowUsage>,
}

/// `GET /rate-limits/{id}/usage`
pub async fn usage(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RuleUsage>, ApiError> {
    let rule = rule(&state, &id)?;
    let window = state.components.rate_limiter().usage(&rule.source_id);
    Ok(Json(RuleUsage { rule, window }))
}
