//! Keyed, pool-scoped store of captured upstream responses.
//!
//! Entries are held in a sharded [`DashMap`] keyed by cache key, so concurrent readers and
//! writers of unrelated keys never contend on a single lock. Writes to the same key resolve
//! last-write-wins under the shard lock. A secondary id index maps the numeric entry ids used by
//! bulk operations back to keys.
//!
//! Expiry is soft: [`CacheStore::lookup`] treats expired entries as misses but leaves them in
//! place so [`CacheStore::peek`] can still serve them as stale fallbacks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

use super::CacheScope;
use crate::types::{expiry_for, CacheEntry, UpstreamResponse};

/// Maximum page size accepted by [`CacheStore::query`].
pub const MAX_PAGE_SIZE: usize = 200;

const TOP_URL_LIMIT: usize = 10;

/// Request snapshot and response captured by a write.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub source_id: Option<String>,
    pub request_method: String,
    pub request_url: String,
    pub response: UpstreamResponse,
    pub ttl_seconds: u64,
}

/// Outcome of a bulk TTL update for a single entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemOutcome {
    Updated,
    NotFound,
}

/// Per-id results of [`CacheStore::bulk_update_ttl`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkUpdateReport {
    pub entries_updated: usize,
    pub results: Vec<(u64, BulkItemOutcome)>,
}

/// Sort field for cache listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    LastHitAt,
    HitCount,
    Size,
    ExpiresAt,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters, sorting and pagination for cache listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheQuery {
    pub source_id: Option<String>,
    pub pool_id: Option<String>,
    /// Case-insensitive substring match against the request URL and the cache key.
    pub search: Option<String>,
    pub status: Option<u16>,
    pub method: Option<String>,
    /// Case-insensitive substring match against the response content type.
    pub content_type: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub min_hits: Option<u64>,
    pub max_hits: Option<u64>,
    pub sort: SortField,
    pub order: SortOrder,
    /// 1-based page number.
    pub page: usize,
    pub limit: usize,
}

impl Default for CacheQuery {
    fn default() -> Self {
        Self {
            source_id: None,
            pool_id: None,
            search: None,
            status: None,
            method: None,
            content_type: None,
            created_from: None,
            created_to: None,
            min_hits: None,
            max_hits: None,
            sort: SortField::default(),
            order: SortOrder::default(),
            page: 1,
            limit: 50,
        }
    }
}

impl CacheQuery {
    fn matches(&self, entry: &CacheEntry) -> bool {
        if let Some(source_id) = &self.source_id {
            if entry.source_id.as_deref() != Some(source_id.as_str()) {
                return false;
            }
        }
        if let Some(pool_id) = &self.pool_id {
            if entry.pool_id.as_deref() != Some(pool_id.as_str()) {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            if !entry.request_url.to_lowercase().contains(&needle) &&
                !entry.cache_key.contains(&needle)
            {
                return false;
            }
        }
        if self.status.is_some_and(|status| entry.response.status != status) {
            return false;
        }
        if let Some(method) = &self.method {
            if !entry.request_method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            let wanted = content_type.to_lowercase();
            let matches = entry
                .response
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.to_lowercase().contains(&wanted));
            if !matches {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| entry.created_at > to) {
            return false;
        }
        if self.min_hits.is_some_and(|min| entry.hit_count < min) {
            return false;
        }
        if self.max_hits.is_some_and(|max| entry.hit_count > max) {
            return false;
        }
        true
    }

    fn compare(&self, a: &CacheEntry, b: &CacheEntry) -> CmpOrdering {
        let ordering = match self.sort {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::LastHitAt => a.last_hit_at.cmp(&b.last_hit_at),
            SortField::HitCount => a.hit_count.cmp(&b.hit_count),
            SortField::Size => a.size_bytes().cmp(&b.size_bytes()),
            // Entries that never expire sort after every finite expiry.
            SortField::ExpiresAt => match (a.expires_at, b.expires_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            },
            SortField::Url => a.request_url.cmp(&b.request_url),
        }
        .then_with(|| a.id.cmp(&b.id));

        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub pages: usize,
    pub total: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePage {
    pub entries: Vec<CacheEntry>,
    pub pagination: Pagination,
}

/// Per-source slice of [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub entries: usize,
    pub hits: u64,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopUrl {
    pub url: String,
    pub hits: u64,
}

/// Aggregate statistics over a cache scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub total_hits: u64,
    pub total_size_bytes: usize,
    pub average_size_bytes: f64,
    /// Keyed by source id; unmanaged entries are grouped under `"unmanaged"`.
    pub by_source: BTreeMap<String, SourceBreakdown>,
    pub status_codes: BTreeMap<u16, usize>,
    pub methods: BTreeMap<String, usize>,
    pub content_types: BTreeMap<String, usize>,
    pub top_urls: Vec<TopUrl>,
}

/// The cache store.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    ids: DashMap<u64, String>,
    next_id: AtomicU64,
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new(), ids: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for `key` if it is unexpired and visible in `scope`.
    #[must_use]
    pub fn get(&self, key: &str, scope: &CacheScope) -> Option<CacheEntry> {
        let now = Utc::now();
        self.entries
            .get(key)
            .filter(|entry| scope.contains(entry) && !entry.is_expired_at(now))
            .map(|entry| entry.clone())
    }

    /// Serves a hit: like [`CacheStore::get`] but atomically bumps `hit_count` and
    /// `last_hit_at` on the stored entry and returns the updated snapshot.
    #[must_use]
    pub fn lookup(&self, key: &str, scope: &CacheScope) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut entry = self.entries.get_mut(key)?;
        if !scope.contains(&entry) || entry.is_expired_at(now) {
            return None;
        }
        entry.hit_count += 1;
        entry.last_hit_at = Some(now);
        Some(entry.clone())
    }

    /// Returns the entry for `key` in `scope` regardless of expiry.
    #[must_use]
    pub fn peek(&self, key: &str, scope: &CacheScope) -> Option<CacheEntry> {
        self.entries.get(key).filter(|entry| scope.contains(entry)).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn get_by_id(&self, id: u64) -> Option<CacheEntry> {
        let key = self.ids.get(&id).map(|key| key.clone())?;
        self.entries.get(&key).map(|entry| entry.clone())
    }

    /// Writes an entry, overwriting any existing entry at the same key.
    ///
    /// An overwrite keeps the entry id and accumulated hit count; the response, scope, TTL and
    /// `created_at` are replaced.
    pub fn put(&self, key: &str, write: CacheWrite, scope: &CacheScope) -> CacheEntry {
        let now = Utc::now();
        let pool_id = scope.pool_id().map(str::to_string);
        let expires_at = expiry_for(now, write.ttl_seconds);

        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            CacheEntry {
                id,
                cache_key: key.to_string(),
                source_id: None,
                pool_id: None,
                request_method: String::new(),
                request_url: String::new(),
                response: write.response.clone(),
                ttl_seconds: 0,
                expires_at: None,
                hit_count: 0,
                created_at: now,
                last_hit_at: None,
            }
        });

        let entry = slot.value_mut();
        entry.source_id = write.source_id;
        entry.pool_id = pool_id;
        entry.request_method = write.request_method;
        entry.request_url = write.request_url;
        entry.response = write.response;
        entry.ttl_seconds = write.ttl_seconds;
        entry.expires_at = expires_at;
        entry.created_at = now;

        // Indexed while the entry is still locked so a racing invalidate cannot strand the id.
        self.ids.insert(entry.id, key.to_string());
        let snapshot = entry.clone();
        drop(slot);

        debug!(cache_key = %key, ttl_seconds = snapshot.ttl_seconds, "cache entry written");
        snapshot
    }

    /// Removes a single entry. Returns the removed entry, if any.
    pub fn invalidate(&self, key: &str) -> Option<CacheEntry> {
        let (_, entry) = self.entries.remove(key)?;
        self.ids.remove(&entry.id);
        debug!(cache_key = %key, "cache entry invalidated");
        Some(entry)
    }

    /// Invalidates several keys, reporting which ones existed.
    pub fn invalidate_many(&self, keys: &[String]) -> Vec<(String, bool)> {
        keys.iter().map(|key| (key.clone(), self.invalidate(key).is_some())).collect()
    }

    /// Recomputes `expires_at = now + ttl` (or no expiry for `0`) for each id independently.
    ///
    /// The id list is treated as a fixed snapshot; a missing id is reported and skipped without
    /// affecting the others.
    pub fn bulk_update_ttl(&self, entry_ids: &[u64], ttl_seconds: u64) -> BulkUpdateReport {
        let mut report = BulkUpdateReport::default();

        for &id in entry_ids {
            let key = self.ids.get(&id).map(|key| key.clone());
            let updated = key.is_some_and(|key| {
                self.entries
                    .get_mut(&key)
                    .filter(|entry| entry.id == id)
                    .map(|mut entry| {
                        entry.ttl_seconds = ttl_seconds;
                        entry.expires_at = expiry_for(Utc::now(), ttl_seconds);
                    })
                    .is_some()
            });

            if updated {
                report.entries_updated += 1;
                report.results.push((id, BulkItemOutcome::Updated));
            } else {
                report.results.push((id, BulkItemOutcome::NotFound));
            }
        }

        debug!(
            requested = entry_ids.len(),
            updated = report.entries_updated,
            ttl_seconds,
            "bulk ttl update applied"
        );
        report
    }

    /// Deletes every entry visible in `scope`. Returns the number removed.
    pub fn purge(&self, scope: &CacheScope) -> usize {
        self.remove_where(|entry| scope.contains(entry))
    }

    /// Deletes every entry matching `predicate`. Returns the number removed.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed_ids = Vec::new();
        self.entries.retain(|_, entry| {
            if predicate(entry) {
                removed_ids.push(entry.id);
                false
            } else {
                true
            }
        });
        for id in &removed_ids {
            self.ids.remove(id);
        }
        removed_ids.len()
    }

    /// Moves every entry of `source_id` into `pool_id` (`None` = dedicated).
    pub fn reassign_source(&self, source_id: &str, pool_id: Option<&str>) -> usize {
        let mut moved = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.source_id.as_deref() == Some(source_id) {
                entry.pool_id = pool_id.map(str::to_string);
                moved += 1;
            }
        }
        moved
    }

    /// Moves every entry of one pool into another.
    pub fn reassign_pool(&self, from_pool: &str, to_pool: &str) -> usize {
        let mut moved = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.pool_id.as_deref() == Some(from_pool) {
                entry.pool_id = Some(to_pool.to_string());
                moved += 1;
            }
        }
        moved
    }

    /// Counts entries visible in `scope`.
    #[must_use]
    pub fn count(&self, scope: &CacheScope) -> usize {
        self.entries.iter().filter(|entry| scope.contains(entry)).count()
    }

    /// Lists entries with filtering, sorting and pagination.
    #[must_use]
    pub fn query(&self, query: &CacheQuery) -> CachePage {
        let mut matched: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|entry| query.matches(entry))
            .map(|entry| entry.clone())
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));

        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let total = matched.len();
        let pages = total.div_ceil(limit).max(1);
        let page = query.page.max(1);

        let offset = (page - 1).saturating_mul(limit);
        let entries = matched.into_iter().skip(offset).take(limit).collect();

        CachePage { entries, pagination: Pagination { page, pages, total, limit } }
    }

    /// Aggregates statistics over every entry visible in `scope`.
    #[must_use]
    pub fn stats(&self, scope: &CacheScope) -> CacheStats {
        let now = Utc::now();
        let mut stats = CacheStats::default();
        let mut url_hits: HashMap<String, u64> = HashMap::new();

        for entry in self.entries.iter().filter(|entry| scope.contains(entry)) {
            let size = entry.size_bytes();
            stats.entry_count += 1;
            if entry.is_expired_at(now) {
                stats.expired_entries += 1;
            } else {
                stats.active_entries += 1;
            }
            stats.total_hits += entry.hit_count;
            stats.total_size_bytes += size;

            let source_key = entry.source_id.clone().unwrap_or_else(|| "unmanaged".to_string());
            let breakdown = stats.by_source.entry(source_key).or_default();
            breakdown.entries += 1;
            breakdown.hits += entry.hit_count;
            breakdown.size_bytes += size;

            *stats.status_codes.entry(entry.response.status).or_default() += 1;
            *stats.methods.entry(entry.request_method.to_ascii_uppercase()).or_default() += 1;
            let content_type = entry
                .response
                .content_type
                .as_deref()
                .and_then(|ct| ct.split(';').next())
                .map_or_else(|| "unknown".to_string(), |ct| ct.trim().to_lowercase());
            *stats.content_types.entry(content_type).or_default() += 1;
            *url_hits.entry(entry.request_url.clone()).or_default() += entry.hit_count;
        }

        if stats.entry_count > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                stats.average_size_bytes =
                    stats.total_size_bytes as f64 / stats.entry_count as f64;
            }
        }

        let mut top_urls: Vec<TopUrl> =
            url_hits.into_iter().map(|(url, hits)| TopUrl { url, hits }).collect();
        top_urls.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.url.cmp(&b.url)));
        top_urls.truncate(TOP_URL_LIMIT);
        stats.top_urls = top_urls;

        stats
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.ttl_seconds == 0 {
                entry.ttl_seconds = 1;
            }
            entry.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}
