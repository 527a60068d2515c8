//! Rate limiting and kill switch behaviour across sources.

use crate::mock_infrastructure::{
    build_runtime, dedicated_source, relative, test_config, UpstreamMock,
};
use relay_core::{
    middleware::{KillSwitchScope, NewRateLimitRule, RateLimiter},
    proxy::ProxyError,
    types::FetchRequest,
};
use std::time::Duration;

fn rule(source_id: &str, max_requests: u32, window_seconds: u64) -> NewRateLimitRule {
    NewRateLimitRule {
        source_id: source_id.to_string(),
        max_requests,
        window_seconds,
        enabled: true,
    }
}

#[tokio::test(start_paused = true)]
async fn test_fourth_request_in_window_is_rejected() {
    let limiter = RateLimiter::new();
    limiter.create_rule(rule("maps", 3, 60)).unwrap();

    for _ in 0..3 {
        limiter.check("maps").unwrap();
    }
    let exceeded = limiter.check("maps").unwrap_err();
    assert!(exceeded.retry_after_secs > 0 && exceeded.retry_after_secs <= 60);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(limiter.check("maps").is_ok());
}

#[tokio::test]
async fn test_rate_limit_applies_to_upstream_fetches() {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/tiles", "{}", 4).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("maps", &upstream.url()));
    config.rate_limits.push(rule("maps", 3, 1));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();
    let forced = || FetchRequest { force_refresh: true, ..relative("maps", "/tiles") };

    for _ in 0..3 {
        orchestrator.fetch(forced()).await.unwrap();
    }
    let err = orchestrator.fetch(forced()).await.unwrap_err();
    let ProxyError::RateLimitExceeded { retry_after_secs, .. } = err else {
        panic!("expected a rate limit rejection, got {err:?}");
    };
    assert!(retry_after_secs >= 1);

    // Cache hits are not counted against the window.
    assert!(orchestrator.fetch(relative("maps", "/tiles")).await.unwrap().cached);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!orchestrator.fetch(forced()).await.unwrap().cached);
    upstream.assert().await;
}

#[tokio::test]
async fn test_global_kill_switch_blocks_every_source() {
    let mut weather = UpstreamMock::new().await;
    weather.json("/today", "{}", 1).await;
    let mut news = UpstreamMock::new().await;
    news.json("/latest", "{}", 1).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("weather", &weather.url()));
    config.sources.push(dedicated_source("news", &news.url()));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    orchestrator.fetch(relative("weather", "/today")).await.unwrap();
    orchestrator.set_kill_switch(None, true).unwrap();

    for request in [relative("weather", "/today"), relative("news", "/latest")] {
        let err = orchestrator.fetch(request).await.unwrap_err();
        assert_eq!(err, ProxyError::KillSwitchActive { scope: KillSwitchScope::Global });
    }

    orchestrator.set_kill_switch(None, false).unwrap();
    assert!(orchestrator.fetch(relative("weather", "/today")).await.unwrap().cached);
    assert!(!orchestrator.fetch(relative("news", "/latest")).await.unwrap().cached);

    weather.assert().await;
    news.assert().await;
}

#[tokio::test]
async fn test_source_kill_switch_leaves_other_sources_alone() {
    let mut weather = UpstreamMock::new().await;
    weather.json("/today", "{}", 1).await;
    let mut news = UpstreamMock::new().await;
    news.json("/latest", "{}", 0).await;

    let mut config = test_config();
    config.sources.push(dedicated_source("weather", &weather.url()));
    config.sources.push(dedicated_source("news", &news.url()));
    let runtime = build_runtime(config);
    let orchestrator = runtime.orchestrator();

    orchestrator.set_kill_switch(Some("news"), true).unwrap();

    let err = orchestrator.fetch(relative("news", "/latest")).await.unwrap_err();
    let scope = KillSwitchScope::Source("news".into());
    assert_eq!(err, ProxyError::KillSwitchActive { scope });
    assert!(orchestrator.fetch(relative("weather", "/today")).await.is_ok());

    weather.assert().await;
    news.assert().await;
}

#[tokio::test]
async fn test_initial_kill_switch_from_config() {
    let mut config = test_config();
    config.kill_switch.enabled = true;
    let runtime = build_runtime(config);

    let err = runtime
        .orchestrator()
        .fetch(FetchRequest::get("https://api.example.com/anything"))
        .await
        .unwrap_err();
    assert!(err.is_kill_switch());
}
