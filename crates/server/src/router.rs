//! Route table and transport layers.

use std::time::Duration;

use axum::{
    body::Body,
    http::Request,
    routing::{get, patch, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    compression::CompressionLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    api::{
        handlers::{cache_policies, data, kill_switch, metrics, pools, rate_limits, sources},
        ApiState,
    },
    middleware,
};

/// Routes of the HTTP API, without transport layers.
pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(metrics::health))
        .route("/metrics", get(metrics::prometheus))
        .route("/data", post(data::fetch))
        .route("/data/cache", get(data::list_cache).delete(data::invalidate))
        .route("/data/cache/bulk-update", patch(data::bulk_update_ttl))
        .route("/data/cache/purge", post(data::purge))
        .route("/data/cache/analytics", get(data::analytics))
        .route("/data/stats", get(data::stats))
        .route("/sources", get(sources::list).post(sources::create))
        .route(
            "/sources/{id}",
            get(sources::get).patch(sources::update).delete(sources::delete),
        )
        .route("/sources/{id}/endpoints", post(sources::add_endpoint))
        .route(
            "/sources/{id}/endpoints/{endpoint_id}",
            axum::routing::delete(sources::remove_endpoint),
        )
        .route("/sources/{id}/circuit-breakers", get(sources::circuit_breakers))
        .route(
            "/sources/{id}/circuit-breakers/{endpoint_id}/reset",
            post(sources::reset_circuit_breaker),
        )
        .route("/rate-limits", get(rate_limits::list).post(rate_limits::create))
        .route(
            "/rate-limits/{id}",
            get(rate_limits::get).patch(rate_limits::update).delete(rate_limits::delete),
        )
        .route("/rate-limits/{id}/usage", get(rate_limits::usage))
        .route("/cache-policies", get(cache_policies::list).post(cache_policies::create))
        .route("/cache-policies/cleanup", post(cache_policies::cleanup))
        .route(
            "/cache-policies/{id}",
            get(cache_policies::get).patch(cache_policies::update).delete(cache_policies::delete),
        )
        .route("/storage-pools", get(pools::list).post(pools::create))
        .route(
            "/storage-pools/{id}",
            get(pools::get).patch(pools::update).delete(pools::delete),
        )
        .route("/storage-pools/{id}/cache", get(pools::entries))
        .route("/storage-pools/{id}/purge", post(pools::purge))
        .route("/storage-pools/{id}/stats", get(pools::stats))
        .route("/storage-pools/{id}/sources", post(pools::assign_source))
        .route(
            "/storage-pools/{id}/sources/{source_id}",
            axum::routing::delete(pools::unassign_source),
        )
        .route("/config/kill-switch", get(kill_switch::get).post(kill_switch::set))
}

/// Builds the application router with request ids, tracing, timeouts, concurrency and body
/// limits, and response compression.
pub fn create_router(state: ApiState) -> Router {
    let server = &state.config.server;
    let concurrency = server.max_concurrent_requests;
    let body_limit = server.body_limit_bytes;
    let timeout = Duration::from_secs(server.request_timeout_seconds);
    let (set_request_id, propagate_request_id) = middleware::create_request_id_layers();

    #[allow(deprecated)]
    let timeout_layer = TimeoutLayer::new(timeout);

    // The last layer runs first: the request id is set before the trace span reads it.
    routes()
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(timeout_layer)
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| middleware::request_span(request)),
        )
        .layer(propagate_request_id)
        .layer(set_request_id)
}
