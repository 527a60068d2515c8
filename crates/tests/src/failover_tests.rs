//! Failover across endpoints, circuit breaking and exhaustion fallbacks.

use crate::mock_infrastructure::{
    build_runtime, endpoint, pool, relative, shared_source, test_config, with_fallback,
    UpstreamMock,
};
use relay_core::{
    proxy::ProxyError,
    types::{BodyEncoding, FallbackMode, FetchRequest, UpstreamResponse},
    upstream::{CircuitBreakerState, NewEndpoint, SourceUpdate},
};
use std::time::Duration;

fn breaker_endpoint(id: &str, base_url: &str, priority: u32, threshold: u32) -> NewEndpoint {
    NewEndpoint { circuit_breaker_threshold: threshold, ..endpoint(id, base_url, priority) }
}

#[tokio::test]
async fn test_open_primary_is_skipped() {
    let mut primary = UpstreamMock::new().await;
    primary.status("/quote", 503, 1).await;
    let mut secondary = UpstreamMock::new().await;
    secondary.json("/quote", r#"{"price":10}"#, 2).await;

    let mut config = test_config();
    config.pools.push(pool("quotes"));
    config.sources.push(shared_source(
        "stocks",
        "quotes",
        vec![
            breaker_endpoint("p0", &primary.url(), 0, 1),
            breaker_endpoint("p1", &secondary.url(), 1, 5),
        ],
    ));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    let first = orchestrator.fetch(relative("stocks", "/quote")).await.unwrap();
    assert_eq!(first.meta.endpoint_id.as_deref(), Some("p1"));
    assert!(first.meta.fallback);

    let breakers = runtime.components().registry().breakers("stocks").await.unwrap();
    let p0 = breakers.iter().find(|breaker| breaker.endpoint_id == "p0").unwrap();
    assert_eq!(p0.breaker.state, CircuitBreakerState::Open);

    let forced = FetchRequest { force_refresh: true, ..relative("stocks", "/quote") };
    let second = orchestrator.fetch(forced).await.unwrap();
    assert_eq!(second.meta.endpoint_id.as_deref(), Some("p1"));

    primary.assert().await;
    secondary.assert().await;
}

#[tokio::test]
async fn test_breaker_blocks_attempts_until_cooldown() {
    let mut upstream = UpstreamMock::new().await;
    upstream.status("/flaky", 503, 3).await;

    let mut config = test_config();
    config.upstream.breaker_cooldown_seconds = 1;
    config.pools.push(pool("flaky"));
    config.sources.push(shared_source(
        "flaky",
        "flaky",
        vec![breaker_endpoint("only", &upstream.url(), 0, 2)],
    ));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    for _ in 0..2 {
        let err = orchestrator.fetch(relative("flaky", "/flaky")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)), "unexpected error: {err:?}");
    }

    let err = orchestrator.fetch(relative("flaky", "/flaky")).await.unwrap_err();
    assert!(matches!(err, ProxyError::AllCircuitsOpen { .. }), "unexpected error: {err:?}");

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let err = orchestrator.fetch(relative("flaky", "/flaky")).await.unwrap_err();
    assert!(matches!(err, ProxyError::Upstream(_)), "probe should reach the endpoint: {err:?}");

    let breakers = runtime.components().registry().breakers("flaky").await.unwrap();
    assert_eq!(breakers[0].breaker.state, CircuitBreakerState::Open);
    upstream.assert().await;
}

#[tokio::test]
async fn test_reset_breaker_restores_endpoint() {
    let mut upstream = UpstreamMock::new().await;
    upstream.status("/x", 500, 1).await;

    let mut config = test_config();
    config.pools.push(pool("p"));
    let endpoints = vec![breaker_endpoint("e", &upstream.url(), 0, 1)];
    config.sources.push(shared_source("s", "p", endpoints));
    let runtime = build_runtime(config);
    let registry = runtime.components().registry();

    runtime.orchestrator().fetch(relative("s", "/x")).await.unwrap_err();
    assert!(registry.resolve_endpoints("s").await.is_empty());

    registry.reset_breaker("s", "e").await.unwrap();
    assert_eq!(registry.resolve_endpoints("s").await.len(), 1);
    upstream.assert().await;
}

#[tokio::test]
async fn test_stale_entry_served_when_all_endpoints_fail() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/news", r#"{"headline":"old"}"#, 1).await;

    let mut config = test_config();
    config.pools.push(pool("news"));
    config.sources.push(shared_source(
        "news",
        "news",
        vec![with_fallback(endpoint("n0", &upstream.url(), 0), FallbackMode::Stale)],
    ));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    orchestrator.fetch(FetchRequest { ttl: Some(1), ..relative("news", "/news") }).await.unwrap();
    upstream.assert_and_clear().await;
    upstream.status("/news", 502, 1).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let result = orchestrator.fetch(relative("news", "/news")).await.unwrap();
    assert!(result.cached);
    assert!(result.meta.stale);
    assert_eq!(result.response.body, r#"{"headline":"old"}"#);
    upstream.assert().await;
}

#[tokio::test]
async fn test_mock_payload_served_when_all_endpoints_fail() {
    let mut upstream = UpstreamMock::new().await;
    upstream.status("/geo", 500, 1).await;

    let mut config = test_config();
    config.pools.push(pool("geo"));
    config.sources.push(shared_source(
        "geo",
        "geo",
        vec![with_fallback(endpoint("g0", &upstream.url(), 0), FallbackMode::Mock)],
    ));
    let runtime = build_runtime(config);
    runtime
        .components()
        .registry()
        .update_source(
            "geo",
            SourceUpdate {
                mock_response: Some(UpstreamResponse {
                    status: 200,
                    headers: Default::default(),
                    body: r#"{"results":[]}"#.to_string(),
                    content_type: Some("application/json".to_string()),
                    body_encoding: BodyEncoding::Utf8,
                }),
                ..SourceUpdate::default()
            },
        )
        .unwrap();

    let result = runtime.orchestrator().fetch(relative("geo", "/geo")).await.unwrap();
    assert!(!result.cached);
    assert!(result.meta.is_mock);
    assert_eq!(result.response.body, r#"{"results":[]}"#);
    assert!(runtime.components().cache_store().is_empty());
    upstream.assert().await;
}

#[tokio::test]
async fn test_client_errors_are_cached_results() {
    let mut upstream = UpstreamMock::new().await;
    upstream.status("/missing", 404, 1).await;

    let mut config = test_config();
    config.pools.push(pool("p"));
    config.sources.push(shared_source("s", "p", vec![endpoint("e", &upstream.url(), 0)]));
    let runtime = build_runtime(config);

    let first = runtime.orchestrator().fetch(relative("s", "/missing")).await.unwrap();
    let second = runtime.orchestrator().fetch(relative("s", "/missing")).await.unwrap();

    assert_eq!(first.response.status, 404);
    assert!(second.cached);
    upstream.assert().await;
}
