//! Storage pools: shared cache namespaces spanning several sources.
//!
//! Pool membership lives on the [`Source`](crate::types::Source) records held by the
//! [`SourceRegistry`]; this manager owns the pool records themselves and cascades pool-level
//! operations (purge, reassignment, statistics) to the [`CacheStore`].
//!
//! Deleting a pool that still has members or entries requires an explicit
//! [`PoolDeletion`] strategy so that entries are never orphaned.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::{
    store::{CachePage, CacheQuery, CacheStats, CacheStore},
    CacheScope,
};
use crate::{
    types::{StorageMode, StoragePool},
    upstream::registry::{RegistryError, SourceRegistry},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PoolError {
    #[error("storage pool '{0}' not found")]
    NotFound(String),

    #[error("storage pool '{0}' already exists")]
    Conflict(String),

    #[error("storage pool name must not be empty")]
    EmptyName,

    #[error(
        "storage pool '{pool_id}' still has {members} member source(s) and {entries} entries; \
         reassign or purge it"
    )]
    NotEmpty { pool_id: String, members: usize, entries: usize },

    #[error("source '{source_id}' has several endpoints and cannot leave shared storage")]
    MultiEndpointMember { source_id: String },

    #[error("invalid reassignment target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Input for [`StoragePoolManager::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStoragePool {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub dedicated: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoragePoolUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// What happens to a non-empty pool's members and entries on deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PoolDeletion {
    /// Refuse to delete a pool that still has members or entries.
    #[default]
    RequireEmpty,
    /// Move members and entries to another pool.
    Reassign { target_pool_id: String },
    /// Delete the pool's entries and return its members to dedicated storage.
    Purge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolDeletionReport {
    pub pool: Option<StoragePool>,
    pub sources_moved: usize,
    pub entries_moved: usize,
    pub entries_purged: usize,
}

/// Pool record plus its current membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    #[serde(flatten)]
    pub pool: StoragePool,
    pub source_ids: Vec<String>,
    pub entry_count: usize,
}

pub struct StoragePoolManager {
    pools: DashMap<String, StoragePool>,
    store: Arc<CacheStore>,
    /// Serialises membership changes so deletion never races an assignment.
    admin: Mutex<()>,
}

impl StoragePoolManager {
    #[must_use]
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { pools: DashMap::new(), store, admin: Mutex::new(()) }
    }

    /// # Errors
    ///
    /// Returns [`PoolError::Conflict`] if the id or name is already taken.
    pub fn create(&self, input: NewStoragePool) -> Result<StoragePool, PoolError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(PoolError::EmptyName);
        }

        let _admin = self.admin.lock();
        if self.pools.iter().any(|pool| pool.name == name) {
            return Err(PoolError::Conflict(name));
        }

        let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.pools.contains_key(&id) {
            return Err(PoolError::Conflict(id));
        }

        let pool = StoragePool {
            id: id.clone(),
            name,
            dedicated: input.dedicated,
            description: input.description,
            created_at: Utc::now(),
        };
        self.pools.insert(id, pool.clone());
        info!(
            pool_id = %pool.id,
            name = %pool.name,
            dedicated = pool.dedicated,
            "storage pool created"
        );
        Ok(pool)
    }

    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown pool or [`PoolError::Conflict`] when
    /// renaming onto an existing name.
    pub fn update(&self, id: &str, update: StoragePoolUpdate) -> Result<StoragePool, PoolError> {
        let _admin = self.admin.lock();

        if let Some(name) = update.name.as_deref().map(str::trim) {
            if name.is_empty() {
                return Err(PoolError::EmptyName);
            }
            if self.pools.iter().any(|pool| pool.id != id && pool.name == name) {
                return Err(PoolError::Conflict(name.to_string()));
            }
        }

        let mut pool = self.pools.get_mut(id).ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        if let Some(name) = update.name {
            pool.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            pool.description = Some(description).filter(|d| !d.is_empty());
        }
        info!(pool_id = %id, "storage pool updated");
        Ok(pool.clone())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<StoragePool> {
        self.pools.get(id).map(|pool| pool.clone())
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.pools.contains_key(id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<StoragePool> {
        let mut pools: Vec<StoragePool> = self.pools.iter().map(|pool| pool.clone()).collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Lists pools with their member sources and entry counts.
    #[must_use]
    pub fn summaries(&self, registry: &SourceRegistry) -> Vec<PoolSummary> {
        self.list()
            .into_iter()
            .map(|pool| {
                let source_ids =
                    registry.sources_in_pool(&pool.id).into_iter().map(|s| s.id).collect();
                let entry_count = self.store.count(&CacheScope::Pool(pool.id.clone()));
                PoolSummary { pool, source_ids, entry_count }
            })
            .collect()
    }

    /// Deletes every cached entry of a pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown pool.
    pub fn purge(&self, id: &str) -> Result<usize, PoolError> {
        self.require(id)?;
        let removed = self.store.purge(&CacheScope::Pool(id.to_string()));
        info!(pool_id = %id, removed, "storage pool purged");
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown pool.
    pub fn stats(&self, id: &str) -> Result<CacheStats, PoolError> {
        self.require(id)?;
        Ok(self.store.stats(&CacheScope::Pool(id.to_string())))
    }

    /// Lists a pool's entries; any `pool_id` already set on `query` is overridden.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown pool.
    pub fn entries(&self, id: &str, mut query: CacheQuery) -> Result<CachePage, PoolError> {
        self.require(id)?;
        query.pool_id = Some(id.to_string());
        Ok(self.store.query(&query))
    }

    /// Moves a source into a pool, switching it to shared storage and migrating its entries.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown pool, or a registry error if the source is
    /// unknown or a dedicated pool already has another member.
    pub fn assign_source(
        &self,
        pool_id: &str,
        source_id: &str,
        registry: &SourceRegistry,
    ) -> Result<usize, PoolError> {
        let _admin = self.admin.lock();
        self.require(pool_id)?;

        registry.set_storage(source_id, StorageMode::Shared, Some(pool_id.to_string()))?;
        let moved = self.store.reassign_source(source_id, Some(pool_id));
        info!(
            pool_id = %pool_id,
            source_id = %source_id,
            entries_moved = moved,
            "source assigned to pool"
        );
        Ok(moved)
    }

    /// Returns a source to dedicated storage, migrating its entries out of the pool.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the source is unknown or has more than one endpoint.
    pub fn unassign_source(
        &self,
        source_id: &str,
        registry: &SourceRegistry,
    ) -> Result<usize, PoolError> {
        let _admin = self.admin.lock();
        registry.set_storage(source_id, StorageMode::Dedicated, None)?;
        let moved = self.store.reassign_source(source_id, None);
        info!(
            source_id = %source_id,
            entries_moved = moved,
            "source returned to dedicated storage"
        );
        Ok(moved)
    }

    /// Deletes a pool according to `strategy`.
    ///
    /// All preconditions are checked before anything is mutated, so a rejected deletion leaves
    /// the pool, its members and its entries untouched.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotFound`] for an unknown pool
    /// - [`PoolError::NotEmpty`] when the pool is in use and `strategy` is
    ///   [`PoolDeletion::RequireEmpty`]
    /// - [`PoolError::InvalidTarget`] when the reassignment target is missing, the pool itself,
    ///   or a dedicated pool that cannot take the members
    /// - [`PoolError::MultiEndpointMember`] when purging would leave a multi-endpoint source in
    ///   dedicated storage
    pub fn delete(
        &self,
        id: &str,
        strategy: PoolDeletion,
        registry: &SourceRegistry,
    ) -> Result<PoolDeletionReport, PoolError> {
        let _admin = self.admin.lock();
        self.require(id)?;

        let members = registry.sources_in_pool(id);
        let scope = CacheScope::Pool(id.to_string());
        let entries = self.store.count(&scope);
        let mut report = PoolDeletionReport::default();

        if !members.is_empty() || entries > 0 {
            match &strategy {
                PoolDeletion::RequireEmpty => {
                    return Err(PoolError::NotEmpty {
                        pool_id: id.to_string(),
                        members: members.len(),
                        entries,
                    });
                }
                PoolDeletion::Reassign { target_pool_id } => {
                    if target_pool_id == id {
                        return Err(PoolError::InvalidTarget(
                            "a pool cannot be reassigned to itself".to_string(),
                        ));
                    }
                    let target = self.get(target_pool_id).ok_or_else(|| {
                        PoolError::InvalidTarget(format!("pool '{target_pool_id}' not found"))
                    })?;
                    if target.dedicated &&
                        registry.sources_in_pool(&target.id).len() + members.len() > 1
                    {
                        return Err(PoolError::InvalidTarget(format!(
                            "dedicated pool '{}' accepts a single member",
                            target.id
                        )));
                    }

                    for source in &members {
                        registry.set_storage(
                            &source.id,
                            StorageMode::Shared,
                            Some(target.id.clone()),
                        )?;
                    }
                    report.sources_moved = members.len();
                    report.entries_moved = self.store.reassign_pool(id, &target.id);
                }
                PoolDeletion::Purge => {
                    if let Some(source) =
                        members.iter().find(|source| registry.endpoint_count(&source.id) > 1)
                    {
                        return Err(PoolError::MultiEndpointMember { source_id: source.id.clone() });
                    }

                    for source in &members {
                        registry.set_storage(&source.id, StorageMode::Dedicated, None)?;
                    }
                    report.sources_moved = members.len();
                    report.entries_purged = self.store.purge(&scope);
                }
            }
        }

        report.pool = self.pools.remove(id).map(|(_, pool)| pool);
        info!(
            pool_id = %id,
            sources_moved = report.sources_moved,
            entries_moved = report.entries_moved,
            entries_purged = report.entries_purged,
            "storage pool deleted"
        );
        Ok(report)
    }

    fn require(&self, id: &str) -> Result<(), PoolError> {
        if self.pools.contains_key(id) {
            Ok(())
        } else {
            Err(PoolError::NotFound(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::store::CacheWrite,
        types::{BodyEncoding, UpstreamResponse},
        upstream::{
            http_client::HttpClient,
            registry::{NewEndpoint, NewSource},
        },
    };
    use std::{collections::BTreeMap, time::Duration};

    struct Fixture {
        store: Arc<CacheStore>,
        pools: Arc<StoragePoolManager>,
        registry: SourceRegistry,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CacheStore::new());
        let pools = Arc::new(StoragePoolManager::new(store.clone()));
        let http_client = Arc::new(HttpClient::new().unwrap());
        let registry = SourceRegistry::new(http_client, pools.clone(), Duration::from_secs(30));
        Fixture { store, pools, registry }
    }

    fn pool(id: &str, dedicated: bool) -> NewStoragePool {
        NewStoragePool {
            id: Some(id.to_string()),
            name: format!("pool {id}"),
            dedicated,
            description: None,
        }
    }

    fn shared_source(id: &str, pool_id: &str, endpoints: usize) -> NewSource {
        NewSource {
            id: Some(id.to_string()),
            name: id.to_string(),
            storage_mode: StorageMode::Shared,
            pool_id: Some(pool_id.to_string()),
            endpoints: (0..endpoints)
                .map(|i| NewEndpoint::new(format!("https://{id}-{i}.example.com")))
                .collect(),
            ..NewSource::default()
        }
    }

    fn write(source_id: &str) -> CacheWrite {
        CacheWrite {
            source_id: Some(source_id.to_string()),
            request_method: "GET".to_string(),
            request_url: format!("source://{source_id}/x"),
            response: UpstreamResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: "{}".to_string(),
                content_type: None,
                body_encoding: BodyEncoding::Utf8,
            },
            ttl_seconds: 60,
        }
    }

    #[test]
    fn test_create_rejects_duplicate_names() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        assert!(matches!(
            f.pools.create(NewStoragePool { name: "pool x".to_string(), ..Default::default() }),
            Err(PoolError::Conflict(_))
        ));
    }

    #[test]
    fn test_delete_non_empty_pool_requires_strategy() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        f.registry.create_source(shared_source("s1", "x", 1)).unwrap();
        f.store.put("k", write("s1"), &CacheScope::Pool("x".to_string()));

        let err = f.pools.delete("x", PoolDeletion::RequireEmpty, &f.registry).unwrap_err();
        assert!(matches!(err, PoolError::NotEmpty { members: 1, entries: 1, .. }));
        assert!(f.pools.exists("x"));
    }

    #[test]
    fn test_delete_with_reassignment_moves_members_and_entries() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        f.pools.create(pool("y", false)).unwrap();
        f.registry.create_source(shared_source("s1", "x", 2)).unwrap();
        f.store.put("k", write("s1"), &CacheScope::Pool("x".to_string()));

        let report = f
            .pools
            .delete("x", PoolDeletion::Reassign { target_pool_id: "y".to_string() }, &f.registry)
            .unwrap();

        assert_eq!(report.sources_moved, 1);
        assert_eq!(report.entries_moved, 1);
        assert!(!f.pools.exists("x"));
        assert_eq!(f.registry.get_source("s1").unwrap().pool_id.as_deref(), Some("y"));
        assert!(f.store.get("k", &CacheScope::Pool("y".to_string())).is_some());
    }

    #[test]
    fn test_delete_with_purge() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        f.registry.create_source(shared_source("s1", "x", 1)).unwrap();
        f.store.put("k", write("s1"), &CacheScope::Pool("x".to_string()));

        let report = f.pools.delete("x", PoolDeletion::Purge, &f.registry).unwrap();
        assert_eq!(report.entries_purged, 1);
        assert!(f.store.is_empty());
        let source = f.registry.get_source("s1").unwrap();
        assert_eq!(source.storage_mode, StorageMode::Dedicated);
        assert!(source.pool_id.is_none());
    }

    #[test]
    fn test_purge_refuses_multi_endpoint_members_without_mutating() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        f.registry.create_source(shared_source("s1", "x", 2)).unwrap();
        f.store.put("k", write("s1"), &CacheScope::Pool("x".to_string()));

        let err = f.pools.delete("x", PoolDeletion::Purge, &f.registry).unwrap_err();
        assert!(matches!(err, PoolError::MultiEndpointMember { .. }));
        assert!(f.pools.exists("x"));
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn test_dedicated_pool_accepts_single_member() {
        let f = fixture();
        f.pools.create(pool("solo", true)).unwrap();
        f.registry.create_source(shared_source("s1", "solo", 1)).unwrap();
        assert!(f.registry.create_source(shared_source("s2", "solo", 1)).is_err());
    }

    #[test]
    fn test_assign_source_migrates_entries() {
        let f = fixture();
        f.pools.create(pool("x", false)).unwrap();
        f.registry
            .create_source(NewSource {
                id: Some("s1".to_string()),
                name: "s1".to_string(),
                endpoints: vec![NewEndpoint::new("https://s1.example.com")],
                ..NewSource::default()
            })
            .unwrap();
        let dedicated = CacheScope::Dedicated { source_id: Some("s1".to_string()) };
        f.store.put("k", write("s1"), &dedicated);

        assert_eq!(f.pools.assign_source("x", "s1", &f.registry).unwrap(), 1);
        assert!(f.store.get("k", &dedicated).is_none());
        assert_eq!(f.pools.stats("x").unwrap().entry_count, 1);

        assert_eq!(f.pools.unassign_source("s1", &f.registry).unwrap(), 1);
        assert!(f.store.get("k", &dedicated).is_some());
    }
}
