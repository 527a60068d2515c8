//! Prometheus exposition and liveness.

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::api::ApiState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// `GET /metrics`
pub async fn prometheus(State(state): State<ApiState>) -> Response {
    let mut response = state.components.metrics_collector().render().into_response();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
    response
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub environment: String,
    pub uptime_seconds: u64,
    pub sources: usize,
    pub cache_entries: usize,
    pub kill_switch: bool,
}

/// `GET /health`
///
/// Reports `degraded` while the global kill switch blocks all traffic.
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let components = &state.components;
    let kill_switch = components.kill_switch().is_global_enabled();
    Json(HealthResponse {
        status: if kill_switch { "degraded" } else { "healthy" },
        version: state.version,
        environment: state.config.environment.clone(),
        uptime_seconds: state.uptime_seconds(),
        sources: components.registry().list_sources().len(),
        cache_entries: components.cache_store().len(),
        kill_switch,
    })
}
