//! Gateway fixtures shared by the integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use relay_core::{
    cache::NewStoragePool,
    config::AppConfig,
    runtime::RelayRuntime,
    types::{FallbackMode, FetchRequest, StorageMode},
    upstream::{NewEndpoint, NewSource},
};
use serde_json::Value;
use server::{api::ApiState, router::create_router};
use std::sync::Arc;
use tower::ServiceExt;

/// Defaults with millisecond retry backoff so failure paths stay fast.
#[must_use]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.retry_base_backoff_ms = 1;
    config.upstream.retry_max_backoff_ms = 2;
    config.upstream.default_timeout_ms = 2_000;
    config
}

/// Builds a runtime without the maintenance loop.
///
/// # Panics
///
/// Panics if the configuration or its seed data is invalid.
#[must_use]
pub fn build_runtime(config: AppConfig) -> RelayRuntime {
    RelayRuntime::builder()
        .with_config(config)
        .disable_maintenance()
        .build()
        .expect("test runtime should build")
}

#[must_use]
pub fn endpoint(id: &str, base_url: &str, priority: u32) -> NewEndpoint {
    NewEndpoint {
        id: Some(id.to_string()),
        priority,
        timeout_ms: 2_000,
        ..NewEndpoint::new(base_url)
    }
}

#[must_use]
pub fn with_fallback(endpoint: NewEndpoint, fallback_mode: FallbackMode) -> NewEndpoint {
    NewEndpoint { fallback_mode, ..endpoint }
}

/// A single-endpoint source with private storage.
#[must_use]
pub fn dedicated_source(id: &str, base_url: &str) -> NewSource {
    NewSource {
        id: Some(id.to_string()),
        name: id.to_string(),
        cost_per_request: 0.01,
        endpoints: vec![endpoint(&format!("{id}-primary"), base_url, 0)],
        ..NewSource::default()
    }
}

/// A source storing into `pool_id`, with any number of endpoints.
#[must_use]
pub fn shared_source(id: &str, pool_id: &str, endpoints: Vec<NewEndpoint>) -> NewSource {
    NewSource {
        id: Some(id.to_string()),
        name: id.to_string(),
        storage_mode: StorageMode::Shared,
        pool_id: Some(pool_id.to_string()),
        cost_per_request: 0.01,
        endpoints,
        ..NewSource::default()
    }
}

#[must_use]
pub fn pool(id: &str) -> NewStoragePool {
    NewStoragePool {
        id: Some(id.to_string()),
        name: id.to_uppercase(),
        ..NewStoragePool::default()
    }
}

/// A `GET` for `path` relative to the named source.
#[must_use]
pub fn relative(source: &str, path: &str) -> FetchRequest {
    FetchRequest { source: Some(source.to_string()), ..FetchRequest::get(path) }
}

#[must_use]
pub fn app(runtime: &RelayRuntime) -> Router {
    let config = Arc::new(runtime.config().clone());
    create_router(ApiState::new(runtime.components().clone(), config))
}

/// Sends one request through the router and decodes the JSON response body.
///
/// # Panics
///
/// Panics if the request cannot be built or the router fails.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, value) = send_full(app, method, uri, body).await;
    (status, value)
}

/// Like [`send`], also returning the response headers.
///
/// # Panics
///
/// Panics if the request cannot be built or the router fails.
pub async fn send_full(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    };
    let response = app.clone().oneshot(request).await.expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
}
