//! End-to-end flows through the HTTP router against mocked upstreams.

use crate::mock_infrastructure::{
    app, build_runtime, dedicated_source, send, send_full, test_config, UpstreamMock,
};
use axum::http::{header::RETRY_AFTER, Method, StatusCode};
use serde_json::json;

#[tokio::test]
async fn test_fetch_and_cache_administration_flow() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/v1/today", r#"{"temp":18}"#, 1).await;

    let runtime = build_runtime(test_config());
    let app = app(&runtime);

    let (status, _) = send(
        &app,
        Method::POST,
        "/storage-pools",
        Some(json!({ "id": "weather", "name": "Weather" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, source) = send(
        &app,
        Method::POST,
        "/sources",
        Some(json!({
            "id": "owm",
            "name": "OpenWeather",
            "storage_mode": "shared",
            "pool_id": "weather",
            "cost_per_request": 0.5,
            "endpoints": [{
                "id": "owm-1",
                "base_url": upstream.url(),
                "auth": { "type": "bearer", "token": "secret" },
            }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(source["endpoints"][0]["auth"]["token"], "***");

    let fetch = json!({ "url": "/v1/today", "source": "owm" });
    let (status, first) = send(&app, Method::POST, "/data", Some(fetch.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cached"], false);
    assert_eq!(first["response"]["body"], r#"{"temp":18}"#);

    let (_, second) = send(&app, Method::POST, "/data", Some(fetch)).await;
    assert_eq!(second["cached"], true);
    assert_eq!(second["cache_key"], first["cache_key"]);
    assert_eq!(second["meta"]["hit_count"], 1);
    upstream.assert().await;

    let (status, page) = send(&app, Method::GET, "/data/cache?pool_id=weather", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pagination"]["total"], 1);
    let entry_id = page["entries"][0]["id"].as_u64().unwrap();

    let (_, stats) = send(&app, Method::GET, "/data/stats", None).await;
    assert_eq!(stats["requests"]["cache_hits"], 1);
    assert_eq!(stats["requests"]["total_saved"], 0.5);
    assert_eq!(stats["cache"]["entry_count"], 1);

    let (status, report) = send(
        &app,
        Method::PATCH,
        "/data/cache/bulk-update",
        Some(json!({ "entry_ids": [entry_id], "ttl_seconds": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["entries_updated"], 1);

    let (_, analytics) =
        send(&app, Method::GET, "/data/cache/analytics?pool_id=weather", None).await;
    assert_eq!(analytics["by_source"]["owm"]["entries"], 1);

    let cache_key = first["cache_key"].clone();
    let (status, removed) =
        send(&app, Method::DELETE, "/data/cache", Some(json!({ "cache_key": cache_key }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["removed"], 1);

    let (status, _) =
        send(&app, Method::DELETE, "/data/cache", Some(json!({ "cache_key": cache_key }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limited_fetch_returns_retry_after() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/search", "[]", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("search", &upstream.url()));
    let runtime = build_runtime(config);
    let app = app(&runtime);

    let (status, rule) = send(
        &app,
        Method::POST,
        "/rate-limits",
        Some(json!({ "source_id": "search", "max_requests": 1, "window_seconds": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let fetch = json!({ "url": "/search", "source": "search", "force_refresh": true });
    let (status, _) = send(&app, Method::POST, "/data", Some(fetch.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send_full(&app, Method::POST, "/data", Some(fetch)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(RETRY_AFTER));
    assert_eq!(body["error"]["code"], "rate_limited");

    let usage_uri = format!("/rate-limits/{}/usage", rule["id"].as_str().unwrap());
    let (_, usage) = send(&app, Method::GET, &usage_uri, None).await;
    assert_eq!(usage["window"]["used"], 1);
    upstream.assert().await;
}

#[tokio::test]
async fn test_source_kill_switch_over_http() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/feed", "{}", 0).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("feed", &upstream.url()));
    let runtime = build_runtime(config);
    let app = app(&runtime);

    let (status, switch) = send(
        &app,
        Method::POST,
        "/config/kill-switch",
        Some(json!({ "enabled": true, "source_id": "feed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(switch["enabled"], false);
    assert_eq!(switch["sources"], json!(["feed"]));

    let (status, body) =
        send(&app, Method::POST, "/data", Some(json!({ "url": "/feed", "source": "feed" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["meta"]["kill_switch"], true);

    let (status, _) = send(
        &app,
        Method::POST,
        "/config/kill-switch",
        Some(json!({ "enabled": true, "source_id": "unknown" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    upstream.assert().await;
}

#[tokio::test]
async fn test_cache_policy_caps_ttl_over_http() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/rates", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("fx", &upstream.url()));
    let runtime = build_runtime(config);
    let app = app(&runtime);

    let (status, policy) = send(
        &app,
        Method::POST,
        "/cache-policies",
        Some(json!({ "source_id": "fx", "max_ttl_seconds": 3600 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        Method::POST,
        "/cache-policies",
        Some(json!({ "source_id": "fx", "no_cache": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, result) = send(
        &app,
        Method::POST,
        "/data",
        Some(json!({ "url": "/rates", "source": "fx", "ttl": 7200 })),
    )
    .await;
    assert_eq!(result["meta"]["ttl_seconds"], 3600);

    let (_, cleanup) = send(&app, Method::POST, "/cache-policies/cleanup", None).await;
    assert_eq!(cleanup["removed"], 0);

    let policy_uri = format!("/cache-policies/{}", policy["id"].as_str().unwrap());
    let (status, _) = send(&app, Method::DELETE, &policy_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    upstream.assert().await;
}

#[tokio::test]
async fn test_extreme_ttl_and_page_values_over_http() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/archive", r#"{"v":1}"#, 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("vault", &upstream.url()));
    let runtime = build_runtime(config);
    let app = app(&runtime);

    let fetch = json!({ "url": "/archive", "source": "vault", "ttl": u64::MAX });
    let (status, first) = send(&app, Method::POST, "/data", Some(fetch.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["meta"]["ttl_seconds"], u64::MAX);
    assert!(first["meta"]["expires_at"].is_null());

    let (status, second) = send(&app, Method::POST, "/data", Some(fetch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cached"], true);
    upstream.assert().await;

    let (_, page) = send(&app, Method::GET, "/data/cache", None).await;
    let entry_id = page["entries"][0]["id"].as_u64().unwrap();
    let (status, report) = send(
        &app,
        Method::PATCH,
        "/data/cache/bulk-update",
        Some(json!({ "entry_ids": [entry_id], "ttl_seconds": u64::MAX - 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["entries_updated"], 1);

    let (status, far) =
        send(&app, Method::GET, "/data/cache?page=18446744073709551615&limit=50", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(far["entries"].as_array().map(Vec::len), Some(0));
    assert_eq!(far["pagination"]["total"], 1);
}

#[tokio::test]
async fn test_source_lifecycle_over_http() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/doc", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("docs", &upstream.url()));
    let runtime = build_runtime(config);
    let app = app(&runtime);

    send(&app, Method::POST, "/data", Some(json!({ "url": "/doc", "source": "docs" }))).await;

    let (status, breakers) =
        send(&app, Method::GET, "/sources/docs/circuit-breakers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(breakers[0]["state"], "closed");

    let (status, _) = send(
        &app,
        Method::POST,
        "/sources/docs/circuit-breakers/docs-primary/reset",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, updated) =
        send(&app, Method::PATCH, "/sources/docs", Some(json!({ "is_active": false }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["is_active"], false);

    let (status, deleted) = send(&app, Method::DELETE, "/sources/docs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["entries_removed"], 1);

    let (status, _) = send(&app, Method::GET, "/sources/docs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    upstream.assert().await;
}

#[tokio::test]
async fn test_pool_deletion_over_http() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/item", "{}", 1).await;

    let runtime = build_runtime(test_config());
    let app = app(&runtime);

    send(&app, Method::POST, "/storage-pools", Some(json!({ "id": "p", "name": "P" }))).await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/sources",
        Some(json!({
            "id": "s",
            "name": "S",
            "endpoints": [{ "base_url": upstream.url() }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, membership) = send(
        &app,
        Method::POST,
        "/storage-pools/p/sources",
        Some(json!({ "source_id": "s" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(membership["entries_moved"], 0);

    send(&app, Method::POST, "/data", Some(json!({ "url": "/item", "source": "s" }))).await;

    let (_, pool_stats) = send(&app, Method::GET, "/storage-pools/p/stats", None).await;
    assert_eq!(pool_stats["entry_count"], 1);

    let (status, body) = send(&app, Method::DELETE, "/storage-pools/p", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, report) =
        send(&app, Method::DELETE, "/storage-pools/p?strategy=purge", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["entries_purged"], 1);
    upstream.assert().await;
}
