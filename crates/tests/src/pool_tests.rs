//! Storage pool scoping, membership changes and deletion strategies.

use crate::mock_infrastructure::{
    build_runtime, dedicated_source, endpoint, pool, relative, shared_source, test_config,
    UpstreamMock,
};
use relay_core::{
    cache::{CacheQuery, CacheScope, PoolDeletion, PoolError},
    runtime::RelayRuntime,
    types::StorageMode,
};

struct Fixture {
    runtime: RelayRuntime,
    shared_key: String,
    dedicated_key: String,
    _upstream: UpstreamMock,
}

/// Source `a` stores into pool `x`; `b` and `c` are dedicated. `a` and `b` have one entry each.
async fn fixture() -> Fixture {
    let mut upstream = UpstreamMock::new().await;
    upstream.json("/a/item", r#"{"from":"a"}"#, 1).await;
    upstream.json("/b/item", r#"{"from":"b"}"#, 1).await;
    let base = upstream.url();

    let mut config = test_config();
    config.pools.push(pool("x"));
    config.pools.push(pool("y"));
    config.sources.push(shared_source("a", "x", vec![endpoint("a0", &format!("{base}/a"), 0)]));
    config.sources.push(dedicated_source("b", &format!("{base}/b")));
    config.sources.push(dedicated_source("c", &format!("{base}/c")));
    let runtime = build_runtime(config);

    let shared = runtime.orchestrator().fetch(relative("a", "/item")).await.unwrap();
    let dedicated = runtime.orchestrator().fetch(relative("b", "/item")).await.unwrap();
    upstream.assert().await;

    Fixture {
        runtime,
        shared_key: shared.cache_key,
        dedicated_key: dedicated.cache_key,
        _upstream: upstream,
    }
}

#[tokio::test]
async fn test_pool_entries_visible_only_through_pool_or_all() {
    let fixture = fixture().await;
    let store = fixture.runtime.components().cache_store();

    let in_pool = store.query(&CacheQuery { pool_id: Some("x".into()), ..CacheQuery::default() });
    assert_eq!(in_pool.pagination.total, 1);
    assert_eq!(in_pool.entries[0].cache_key, fixture.shared_key);
    assert_eq!(store.query(&CacheQuery::default()).pagination.total, 2);

    let pool_scope = CacheScope::Pool("x".into());
    assert!(store.peek(&fixture.shared_key, &pool_scope).is_some());
    assert!(store.peek(&fixture.shared_key, &CacheScope::All).is_some());
    for source in ["b", "c"] {
        let dedicated = CacheScope::Dedicated { source_id: Some(source.to_string()) };
        assert!(store.peek(&fixture.shared_key, &dedicated).is_none());
        let stats = store.stats(&dedicated);
        assert!(!stats.by_source.contains_key("a"));
    }
    assert!(store.peek(&fixture.dedicated_key, &pool_scope).is_none());

    let other_pool =
        store.query(&CacheQuery { pool_id: Some("y".into()), ..CacheQuery::default() });
    assert_eq!(other_pool.pagination.total, 0);
}

#[tokio::test]
async fn test_pool_stats_cover_members_only() {
    let fixture = fixture().await;
    let stats = fixture.runtime.components().pools().stats("x").unwrap();

    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.by_source.keys().collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn test_assigning_a_source_moves_its_entries() {
    let fixture = fixture().await;
    let components = fixture.runtime.components();

    let moved = components.pools().assign_source("x", "b", components.registry()).unwrap();
    assert_eq!(moved, 1);
    assert_eq!(components.registry().get_source("b").unwrap().storage_mode, StorageMode::Shared);
    assert_eq!(components.cache_store().count(&CacheScope::Pool("x".into())), 2);

    let back = components.pools().unassign_source("b", components.registry()).unwrap();
    assert_eq!(back, 1);
    let dedicated = CacheScope::Dedicated { source_id: Some("b".into()) };
    assert!(components.cache_store().peek(&fixture.dedicated_key, &dedicated).is_some());
}

#[tokio::test]
async fn test_non_empty_pool_requires_a_strategy() {
    let fixture = fixture().await;
    let components = fixture.runtime.components();

    let err = components
        .pools()
        .delete("x", PoolDeletion::RequireEmpty, components.registry())
        .unwrap_err();
    assert!(matches!(err, PoolError::NotEmpty { members: 1, entries: 1, .. }));

    let report = components
        .pools()
        .delete(
            "x",
            PoolDeletion::Reassign { target_pool_id: "y".into() },
            components.registry(),
        )
        .unwrap();
    assert_eq!(report.sources_moved, 1);
    assert_eq!(report.entries_moved, 1);
    assert!(!components.pools().exists("x"));
    assert_eq!(components.registry().get_source("a").unwrap().pool_id.as_deref(), Some("y"));
    let target = CacheScope::Pool("y".into());
    assert!(components.cache_store().peek(&fixture.shared_key, &target).is_some());
}

#[tokio::test]
async fn test_purge_strategy_returns_members_to_dedicated_storage() {
    let fixture = fixture().await;
    let components = fixture.runtime.components();

    let report =
        components.pools().delete("x", PoolDeletion::Purge, components.registry()).unwrap();
    assert_eq!(report.entries_purged, 1);

    let source = components.registry().get_source("a").unwrap();
    assert_eq!(source.storage_mode, StorageMode::Dedicated);
    assert!(source.pool_id.is_none());
    assert_eq!(components.cache_store().len(), 1);
}

#[tokio::test]
async fn test_pool_purge_leaves_dedicated_entries() {
    let fixture = fixture().await;

    let removed = fixture.runtime.orchestrator().purge(&CacheScope::Pool("x".into()));
    assert_eq!(removed, 1);
    let store = fixture.runtime.components().cache_store();
    assert!(store.peek(&fixture.dedicated_key, &CacheScope::All).is_some());
}
