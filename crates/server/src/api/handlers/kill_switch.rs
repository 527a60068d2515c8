//! `/config/kill-switch`

use axum::{extract::State, Json};
use relay_core::middleware::KillSwitchStatus;
use serde::Deserialize;
use serde_json::json;

use super::JsonBody;
use crate::api::{audit, ApiError, ApiState, ClientAddr};

#[derive(Debug, Deserialize)]
pub struct KillSwitchRequest {
    pub enabled: bool,
    /// Targets one source instead of the global switch.
    #[serde(default)]
    pub source_id: Option<String>,
}

/// `GET /config/kill-switch`
pub async fn get(State(state): State<ApiState>) -> Json<KillSwitchStatus> {
    Json(state.components.kill_switch().snapshot())
}

/// `POST /config/kill-switch`
pub async fn set(
    State(state): State<ApiState>,
    ClientAddr(client): ClientAddr,
    JsonBody(request): JsonBody<KillSwitchRequest>,
) -> Result<Json<KillSwitchStatus>, ApiError> {
    let status = state
        .components
        .orchestrator()
        .set_kill_switch(request.source_id.as_deref(), request.enabled)?;
    audit::log_update(
        "kill_switch",
        request.source_id.as_deref().unwrap_or("global"),
        client,
        Some(json!({ "enabled": request.enabled })),
    );
    Ok(Json(status))
}
