//! Response caching: key derivation, the pool-scoped store, per-source policies, storage pools
//! and in-flight request coalescing.
//!
//! # Architecture
//!
//! ```text
//!  FetchRequest ──► CacheKeyResolver ──► key
//!                                          │
//!        ┌─────────────────────────────────▼──────────────────────────┐
//!        │                        CacheStore                          │
//!        │  DashMap<key, CacheEntry>  (soft expiry, last-write-wins)  │
//!        └────────▲───────────────────────▲───────────────────▲───────┘
//!                 │                       │                   │
//!        ┌────────┴───────┐      ┌────────┴───────┐   ┌───────┴───────┐
//!        │ PolicyEnforcer │      │ StoragePool    │   │  InflightMap  │
//!        │ ttl clamp,     │      │ Manager        │   │  per-key      │
//!        │ no_cache,      │      │ scoping, stats,│   │  coalescing   │
//!        │ cleanup        │      │ purge/reassign │   │               │
//!        └────────────────┘      └────────────────┘   └───────────────┘
//! ```
//!
//! Every entry belongs to exactly one [`CacheScope`]: a storage pool (shared sources) or the
//! dedicated space of a single source. Unmanaged requests, which match no source, land in the
//! dedicated space with no source id.

pub mod inflight;
pub mod key;
pub mod policy;
pub mod pools;
pub mod store;

pub use inflight::{InflightGuard, InflightMap};
pub use key::{canonicalize_url, CacheKeyResolver};
pub use policy::{CacheDecision, CachePolicyUpdate, NewCachePolicy, PolicyEnforcer, PolicyError};
pub use pools::{
    NewStoragePool, PoolDeletion, PoolDeletionReport, PoolError, PoolSummary, StoragePoolManager,
    StoragePoolUpdate,
};
pub use store::{
    BulkItemOutcome, BulkUpdateReport, CachePage, CacheQuery, CacheStats, CacheStore, CacheWrite,
    Pagination, SortField, SortOrder,
};

use crate::types::CacheEntry;

/// The namespace a cache read, write or purge operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Every entry regardless of pool.
    All,
    /// Entries stored in the given storage pool.
    Pool(String),
    /// Entries outside any pool, optionally narrowed to one source.
    Dedicated { source_id: Option<String> },
}

impl CacheScope {
    /// Returns `true` if `entry` is visible in this scope.
    #[must_use]
    pub fn contains(&self, entry: &CacheEntry) -> bool {
        match self {
            Self::All => true,
            Self::Pool(pool_id) => entry.pool_id.as_deref() == Some(pool_id.as_str()),
            Self::Dedicated { source_id } => {
                entry.pool_id.is_none() && entry.source_id.as_deref() == source_id.as_deref()
            }
        }
    }

    /// Pool id written onto entries stored under this scope.
    #[must_use]
    pub fn pool_id(&self) -> Option<&str> {
        match self {
            Self::Pool(pool_id) => Some(pool_id),
            Self::All | Self::Dedicated { .. } => None,
        }
    }
}
