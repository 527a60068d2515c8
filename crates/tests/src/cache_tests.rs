//! Cache semantics through the orchestrator: reuse, TTL handling, bulk updates and policies.

use crate::mock_infrastructure::{
    build_runtime, dedicated_source, relative, test_config, UpstreamMock,
};
use chrono::{Duration, Utc};
use futures::future::join_all;
use relay_core::{
    cache::{CacheQuery, NewCachePolicy},
    types::FetchRequest,
};

#[tokio::test]
async fn test_identical_fetch_reuses_key_without_upstream_call() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/v1/forecast", r#"{"temp":21}"#, 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("weather", &upstream.url()));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    let first = orchestrator.fetch(relative("weather", "/v1/forecast")).await.unwrap();
    let second = orchestrator.fetch(relative("weather", "/v1/forecast")).await.unwrap();
    let third = orchestrator
        .fetch(FetchRequest::get(format!("{}/v1/forecast", upstream.url())))
        .await
        .unwrap();

    upstream.assert().await;
    assert!(!first.cached);
    assert!(second.cached && third.cached);
    assert_eq!(first.cache_key, second.cache_key);
    assert_eq!(first.cache_key, third.cache_key);
    assert_eq!(third.meta.hit_count, 2);
}

#[tokio::test]
async fn test_zero_ttl_never_expires() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/static", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("assets", &upstream.url()));
    let runtime = build_runtime(config);

    let request = FetchRequest { ttl: Some(0), ..relative("assets", "/static") };
    let result = runtime.orchestrator().fetch(request).await.unwrap();
    assert_eq!(result.meta.ttl_seconds, 0);
    assert!(result.meta.expires_at.is_none());

    let mut entries = runtime.components().cache_store().query(&CacheQuery::default()).entries;
    let entry = entries.remove(0);
    assert!(!entry.is_expired_at(Utc::now() + Duration::days(365 * 100)));
    assert!(runtime.orchestrator().fetch(relative("assets", "/static")).await.unwrap().cached);
    upstream.assert().await;
}

#[tokio::test]
async fn test_bulk_update_ttl_clears_expiry() {
    let mut upstream = UpstreamMock::new().await;
    for path in ["/a", "/b", "/c"] {
        upstream.json(path, "{}", 1).await;
    }

    let mut config = test_config();
    config.sources.push(dedicated_source("api", &upstream.url()));
    let runtime = build_runtime(config);

    for path in ["/a", "/b", "/c"] {
        let request = FetchRequest { ttl: Some(60), ..relative("api", path) };
        runtime.orchestrator().fetch(request).await.unwrap();
    }

    let store = runtime.components().cache_store();
    let ids: Vec<u64> =
        store.query(&CacheQuery::default()).entries.iter().map(|entry| entry.id).collect();
    assert_eq!(ids.len(), 3);

    let report = runtime.orchestrator().bulk_update_ttl(&ids, 0);
    assert_eq!(report.entries_updated, 3);
    for id in ids {
        let entry = store.get_by_id(id).unwrap();
        assert_eq!(entry.ttl_seconds, 0);
        assert!(entry.expires_at.is_none());
    }
}

#[tokio::test]
async fn test_bulk_update_reports_missing_ids() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/a", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("api", &upstream.url()));
    let runtime = build_runtime(config);
    runtime.orchestrator().fetch(relative("api", "/a")).await.unwrap();

    let id = runtime.components().cache_store().query(&CacheQuery::default()).entries[0].id;
    let report = runtime.orchestrator().bulk_update_ttl(&[id, 999_999], 120);

    assert_eq!(report.entries_updated, 1);
    assert_eq!(report.results.len(), 2);
}

#[tokio::test]
async fn test_policy_caps_requested_ttl() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/rates", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("fx", &upstream.url()));
    config.cache_policies.push(NewCachePolicy {
        source_id: "fx".to_string(),
        max_ttl_seconds: Some(3600),
        ..NewCachePolicy::default()
    });
    let runtime = build_runtime(config);

    let request = FetchRequest { ttl: Some(7200), ..relative("fx", "/rates") };
    let result = runtime.orchestrator().fetch(request).await.unwrap();

    assert_eq!(result.meta.ttl_seconds, 3600);
    let mut entries = runtime.components().cache_store().query(&CacheQuery::default()).entries;
    assert_eq!(entries.pop().unwrap().ttl_seconds, 3600);
}

#[tokio::test]
async fn test_no_cache_policy_returns_without_storing() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/live", "{}", 2).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("ticker", &upstream.url()));
    config.cache_policies.push(NewCachePolicy {
        source_id: "ticker".to_string(),
        no_cache: true,
        ..NewCachePolicy::default()
    });
    let runtime = build_runtime(config);

    let first = runtime.orchestrator().fetch(relative("ticker", "/live")).await.unwrap();
    let second = runtime.orchestrator().fetch(relative("ticker", "/live")).await.unwrap();

    upstream.assert().await;
    assert!(first.meta.no_cache);
    assert!(!second.cached);
    assert!(runtime.components().cache_store().is_empty());
}

#[tokio::test]
async fn test_policy_cleanup_removes_expired_entries() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/short", "{}", 1).await;
    upstream.json("/long", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("api", &upstream.url()));
    config.cache_policies.push(NewCachePolicy {
        source_id: "api".to_string(),
        ..NewCachePolicy::default()
    });
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    orchestrator.fetch(FetchRequest { ttl: Some(1), ..relative("api", "/short") }).await.unwrap();
    orchestrator.fetch(FetchRequest { ttl: Some(600), ..relative("api", "/long") }).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;

    let removed = orchestrator.cleanup_policies();
    assert_eq!(removed.get("api"), Some(&1));
    assert_eq!(runtime.components().cache_store().len(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_share_one_upstream_call() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/v1/quote", r#"{"price":10}"#, 1).await;
    upstream.json("/v1/other", r#"{"price":11}"#, 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("quotes", &upstream.url()));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    let duplicates = (0..8).map(|_| orchestrator.fetch(relative("quotes", "/v1/quote")));
    let other = orchestrator.fetch(relative("quotes", "/v1/other"));
    let (results, other) = tokio::join!(join_all(duplicates), other);

    let results: Vec<_> = results.into_iter().map(|result| result.unwrap()).collect();
    assert_eq!(results.iter().filter(|result| !result.cached).count(), 1);
    assert!(results.iter().all(|result| result.cache_key == results[0].cache_key));
    assert_ne!(other.unwrap().cache_key, results[0].cache_key);
    assert_eq!(orchestrator.inflight_count(), 0);
    upstream.assert().await;
}
