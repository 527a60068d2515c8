use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::RateLimitRule;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RateLimitError {
    #[error("rate limit rule '{0}' not found")]
    NotFound(String),

    #[error("source '{source_id}' already has a rate limit rule")]
    Conflict { source_id: String },

    #[error("invalid rate limit rule: {0}")]
    Invalid(String),
}

/// A request was rejected because its source used up the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    /// Seconds until the window rolls over, at least 1.
    pub retry_after_secs: u64,
}

/// Input for [`RateLimiter::create_rule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRateLimitRule {
    pub source_id: String,
    pub max_requests: u32,
    pub window_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for [`RateLimiter::update_rule`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitRuleUpdate {
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub window_seconds: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Current window usage for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub used: u32,
    pub max_requests: u32,
    pub resets_in_secs: u64,
}

/// Fixed-window request counter per source.
///
/// Each source has at most one [`RateLimitRule`]. A window opens on the first request after the
/// previous one elapsed, so a source that stays idle carries no state beyond its rule. Counting
/// happens under the map shard's entry lock, so concurrent checks for one source never lose or
/// double count an increment while checks for different sources proceed independently.
#[derive(Debug, Default)]
pub struct RateLimiter {
    rules: DashMap<String, RateLimitRule>,
    windows: Arc<DashMap<String, FixedWindow>>,
}

#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    started_at: Instant,
    count: u32,
    last_access: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request against the source's rule.
    ///
    /// Sources without a rule, or with a disabled rule, always pass.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the current window is full.
    pub fn check(&self, source_id: &str) -> Result<(), RateLimitExceeded> {
        let Some((max_requests, window)) = self
            .rules
            .get(source_id)
            .filter(|rule| rule.enabled)
            .map(|rule| (rule.max_requests, Duration::from_secs(rule.window_seconds)))
        else {
            return Ok(());
        };

        let now = Instant::now();
        let mut state = self.windows.entry(source_id.to_string()).or_insert_with(|| FixedWindow {
            started_at: now,
            count: 0,
            last_access: now,
        });

        let elapsed = now.duration_since(state.started_at);
        if elapsed >= window {
            state.started_at = now;
            state.count = 0;
        }
        state.last_access = now;

        if state.count >= max_requests {
            let remaining = window.saturating_sub(now.duration_since(state.started_at));
            let retry_after_secs = ceil_secs(remaining).max(1);
            debug!(source = %source_id, retry_after_secs, "rate limit exceeded");
            return Err(RateLimitExceeded { retry_after_secs });
        }

        state.count += 1;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RateLimitError::Conflict`] if the source already has a rule, or
    /// [`RateLimitError::Invalid`] for a zero limit or window.
    pub fn create_rule(&self, input: NewRateLimitRule) -> Result<RateLimitRule, RateLimitError> {
        validate_limits(input.max_requests, input.window_seconds)?;

        match self.rules.entry(input.source_id.clone()) {
            Entry::Occupied(_) => Err(RateLimitError::Conflict { source_id: input.source_id }),
            Entry::Vacant(slot) => {
                let rule = RateLimitRule {
                    id: uuid::Uuid::new_v4().to_string(),
                    source_id: input.source_id,
                    max_requests: input.max_requests,
                    window_seconds: input.window_seconds,
                    enabled: input.enabled,
                };
                slot.insert(rule.clone());
                info!(
                    rule_id = %rule.id,
                    source = %rule.source_id,
                    max_requests = rule.max_requests,
                    window_seconds = rule.window_seconds,
                    "rate limit rule created"
                );
                Ok(rule)
            }
        }
    }

    /// Applies a partial update. The source's current window is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::NotFound`] for an unknown id or [`RateLimitError::Invalid`]
    /// if the result would have a zero limit or window.
    pub fn update_rule(
        &self,
        id: &str,
        update: RateLimitRuleUpdate,
    ) -> Result<RateLimitRule, RateLimitError> {
        let source_id =
            self.source_for(id).ok_or_else(|| RateLimitError::NotFound(id.to_string()))?;
        let mut rule = self
            .rules
            .get_mut(&source_id)
            .filter(|rule| rule.id == id)
            .ok_or_else(|| RateLimitError::NotFound(id.to_string()))?;

        let max_requests = update.max_requests.unwrap_or(rule.max_requests);
        let window_seconds = update.window_seconds.unwrap_or(rule.window_seconds);
        validate_limits(max_requests, window_seconds)?;

        rule.max_requests = max_requests;
        rule.window_seconds = window_seconds;
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        let updated = rule.clone();
        drop(rule);

        self.windows.remove(&source_id);
        info!(
            rule_id = %id,
            source = %source_id,
            enabled = updated.enabled,
            "rate limit rule updated"
        );
        Ok(updated)
    }

    /// # Errors
    ///
    /// Returns [`RateLimitError::NotFound`] for an unknown id.
    pub fn delete_rule(&self, id: &str) -> Result<RateLimitRule, RateLimitError> {
        let source_id =
            self.source_for(id).ok_or_else(|| RateLimitError::NotFound(id.to_string()))?;
        let (_, rule) = self
            .rules
            .remove_if(&source_id, |_, rule| rule.id == id)
            .ok_or_else(|| RateLimitError::NotFound(id.to_string()))?;
        self.windows.remove(&source_id);
        info!(rule_id = %id, source = %source_id, "rate limit rule deleted");
        Ok(rule)
    }

    /// Drops the rule and window of a deleted source.
    pub fn remove_for_source(&self, source_id: &str) -> Option<RateLimitRule> {
        self.windows.remove(source_id);
        self.rules.remove(source_id).map(|(_, rule)| rule)
    }

    #[must_use]
    pub fn get_rule(&self, id: &str) -> Option<RateLimitRule> {
        self.rules.iter().find(|rule| rule.id == id).map(|rule| rule.clone())
    }

    #[must_use]
    pub fn rule_for_source(&self, source_id: &str) -> Option<RateLimitRule> {
        self.rules.get(source_id).map(|rule| rule.clone())
    }

    #[must_use]
    pub fn list_rules(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> = self.rules.iter().map(|r| r.clone()).collect();
        rules.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        rules
    }

    /// Usage of the source's open window, if it has one that has not yet elapsed.
    #[must_use]
    pub fn usage(&self, source_id: &str) -> Option<WindowUsage> {
        let rule = self.rules.get(source_id)?;
        let window = Duration::from_secs(rule.window_seconds);
        let state = self.windows.get(source_id)?;
        let elapsed = Instant::now().duration_since(state.started_at);
        if elapsed >= window {
            return None;
        }
        Some(WindowUsage {
            used: state.count,
            max_requests: rule.max_requests,
            resets_in_secs: ceil_secs(window - elapsed),
        })
    }

    /// Removes windows idle for longer than their rule's window, and windows whose rule is gone.
    #[must_use]
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();

        self.windows.retain(|source_id, state| {
            self.rules.get(source_id).is_some_and(|rule| {
                now.duration_since(state.last_access) < Duration::from_secs(rule.window_seconds)
            })
        });

        before.saturating_sub(self.windows.len())
    }

    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn source_for(&self, id: &str) -> Option<String> {
        self.rules.iter().find(|rule| rule.id == id).map(|rule| rule.source_id.clone())
    }
}

fn validate_limits(max_requests: u32, window_seconds: u64) -> Result<(), RateLimitError> {
    if max_requests == 0 {
        return Err(RateLimitError::Invalid("max_requests must be at least 1".to_string()));
    }
    if window_seconds == 0 {
        return Err(RateLimitError::Invalid("window_seconds must be at least 1".to_string()));
    }
    Ok(())
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
