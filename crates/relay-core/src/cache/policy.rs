//! Per-source cache policies: TTL ceilings, caching disablement and purge effects.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use super::store::CacheStore;
use crate::types::CachePolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    #[error("cache policy '{0}' not found")]
    NotFound(String),

    #[error("source '{source_id}' already has a cache policy")]
    Conflict { source_id: String },

    #[error("invalid purge schedule '{0}': expected five whitespace-separated fields")]
    InvalidSchedule(String),
}

/// Input for [`PolicyEnforcer::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCachePolicy {
    pub source_id: String,
    #[serde(default)]
    pub max_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub purge_schedule: Option<String>,
}

/// Partial update for [`PolicyEnforcer::update`].
///
/// `max_ttl_seconds: Some(0)` removes the cap and an empty `purge_schedule` clears the schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicyUpdate {
    #[serde(default)]
    pub max_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub no_cache: Option<bool>,
    #[serde(default)]
    pub purge_schedule: Option<String>,
}

/// Whether and how long a successful upstream result is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Store { ttl_seconds: u64 },
    Skip,
}

/// Holds at most one [`CachePolicy`] per source.
#[derive(Debug, Default)]
pub struct PolicyEnforcer {
    policies: DashMap<String, CachePolicy>,
}

impl PolicyEnforcer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy for a source.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Conflict`] if the source already has a policy, or
    /// [`PolicyError::InvalidSchedule`] for a malformed purge schedule.
    pub fn create(&self, input: NewCachePolicy) -> Result<CachePolicy, PolicyError> {
        let purge_schedule = normalize_schedule(input.purge_schedule)?;
        let now = Utc::now();

        match self.policies.entry(input.source_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PolicyError::Conflict { source_id: input.source_id })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let policy = CachePolicy {
                    id: uuid::Uuid::new_v4().to_string(),
                    source_id: input.source_id,
                    max_ttl_seconds: input.max_ttl_seconds.filter(|cap| *cap > 0),
                    no_cache: input.no_cache,
                    purge_schedule,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(policy.clone());
                info!(
                    policy_id = %policy.id,
                    source_id = %policy.source_id,
                    max_ttl_seconds = ?policy.max_ttl_seconds,
                    no_cache = policy.no_cache,
                    "cache policy created"
                );
                Ok(policy)
            }
        }
    }

    /// Applies a partial update to the policy with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] for an unknown id or
    /// [`PolicyError::InvalidSchedule`] for a malformed purge schedule.
    pub fn update(&self, id: &str, update: CachePolicyUpdate) -> Result<CachePolicy, PolicyError> {
        let purge_schedule = match update.purge_schedule {
            Some(schedule) => Some(normalize_schedule(Some(schedule))?),
            None => None,
        };

        let source_id = self.source_for(id).ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        let mut policy = self
            .policies
            .get_mut(&source_id)
            .filter(|policy| policy.id == id)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;

        if let Some(cap) = update.max_ttl_seconds {
            policy.max_ttl_seconds = Some(cap).filter(|cap| *cap > 0);
        }
        if let Some(no_cache) = update.no_cache {
            policy.no_cache = no_cache;
        }
        if let Some(schedule) = purge_schedule {
            policy.purge_schedule = schedule;
        }
        policy.updated_at = Utc::now();

        info!(policy_id = %id, source_id = %policy.source_id, "cache policy updated");
        Ok(policy.clone())
    }

    /// Removes the policy with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] for an unknown id.
    pub fn delete(&self, id: &str) -> Result<CachePolicy, PolicyError> {
        let source_id = self.source_for(id).ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        let (_, policy) = self
            .policies
            .remove_if(&source_id, |_, policy| policy.id == id)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        info!(policy_id = %id, source_id = %policy.source_id, "cache policy deleted");
        Ok(policy)
    }

    /// Drops the policy of a deleted source, if any.
    pub fn remove_for_source(&self, source_id: &str) -> Option<CachePolicy> {
        self.policies.remove(source_id).map(|(_, policy)| policy)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<CachePolicy> {
        self.policies.iter().find(|policy| policy.id == id).map(|policy| policy.clone())
    }

    #[must_use]
    pub fn for_source(&self, source_id: &str) -> Option<CachePolicy> {
        self.policies.get(source_id).map(|policy| policy.clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<CachePolicy> {
        let mut policies: Vec<CachePolicy> =
            self.policies.iter().map(|policy| policy.clone()).collect();
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    /// True when a policy disables caching for `source_id`.
    #[must_use]
    pub fn is_no_cache(&self, source_id: Option<&str>) -> bool {
        source_id.and_then(|id| self.policies.get(id)).is_some_and(|policy| policy.no_cache)
    }

    /// Decides whether a successful result for `source_id` is persisted and with which TTL.
    ///
    /// Without a policy, or without a cap, the requested TTL passes through unchanged. With a
    /// cap, `effective = min(requested, cap)`, and a requested `0` ("never expire") becomes the
    /// cap.
    #[must_use]
    pub fn decide(&self, source_id: Option<&str>, requested_ttl: u64) -> CacheDecision {
        let Some(policy) = source_id.and_then(|id| self.policies.get(id)) else {
            return CacheDecision::Store { ttl_seconds: requested_ttl };
        };

        if policy.no_cache {
            debug!(source_id = %policy.source_id, "caching disabled by policy");
            return CacheDecision::Skip;
        }

        let ttl_seconds = match policy.max_ttl_seconds {
            Some(cap) if requested_ttl == 0 => cap,
            Some(cap) => requested_ttl.min(cap),
            None => requested_ttl,
        };
        CacheDecision::Store { ttl_seconds }
    }

    /// Applies the purge effect of every policy to the store.
    ///
    /// Sources with `no_cache` lose every entry; other sources lose their expired entries.
    /// Returns the number of entries removed per source id.
    pub fn cleanup(&self, store: &CacheStore) -> BTreeMap<String, usize> {
        let targets: Vec<(String, bool)> =
            self.policies
                .iter()
                .map(|policy| (policy.source_id.clone(), policy.no_cache))
                .collect();

        let now = Utc::now();
        let mut removed = BTreeMap::new();
        for (source_id, no_cache) in targets {
            let count = store.remove_where(|entry| {
                entry.source_id.as_deref() == Some(source_id.as_str()) &&
                    (no_cache || entry.is_expired_at(now))
            });
            if count > 0 {
                info!(source_id = %source_id, removed = count, "policy cleanup removed entries");
            }
            removed.insert(source_id, count);
        }
        removed
    }

    fn source_for(&self, id: &str) -> Option<String> {
        self.policies.iter().find(|policy| policy.id == id).map(|policy| policy.source_id.clone())
    }
}

/// Empty schedules clear the field; anything else must have five cron fields.
fn normalize_schedule(schedule: Option<String>) -> Result<Option<String>, PolicyError> {
    let Some(schedule) = schedule else {
        return Ok(None);
    };
    let trimmed = schedule.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.split_whitespace().count() != 5 {
        return Err(PolicyError::InvalidSchedule(trimmed.to_string()));
    }
    Ok(Some(trimmed.split_whitespace().collect::<Vec<_>>().join(" ")))
}
