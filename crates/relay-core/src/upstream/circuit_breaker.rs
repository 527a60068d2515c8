//! Per-endpoint circuit breaker with a single-probe half-open state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};

/// Everything that changes on a transition, kept under one lock.
#[derive(Debug)]
struct BreakerInner {
    /// Consecutive failures since the last success.
    failure_count: u32,
    /// When the circuit last opened; the cool-down is measured from here.
    opened_at: Option<Instant>,
    /// Wall-clock twin of `opened_at` for reporting.
    opened_at_wall: Option<DateTime<Utc>>,
    /// Start of the half-open probe currently in flight, if any.
    probe_started_at: Option<Instant>,
    state: CircuitBreakerState,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            failure_count: 0,
            opened_at: None,
            opened_at_wall: None,
            probe_started_at: None,
            state: CircuitBreakerState::Closed,
        }
    }

    fn open(&mut self) {
        self.state = CircuitBreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.probe_started_at = None;
    }

    fn close(&mut self) {
        self.state = CircuitBreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.probe_started_at = None;
    }
}

/// Stops sending traffic to an endpoint after `threshold` consecutive failures.
///
/// Once the cool-down has passed the breaker goes half-open and admits exactly one probe. The
/// probe's outcome either closes the breaker or re-opens it with a fresh cool-down.
///
/// Each endpoint owns its breaker; no lock is shared between endpoints.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    threshold: u32,
    /// Time spent open before a probe is admitted.
    cooldown: Duration,
}

/// ```text
/// Closed --threshold reached--> Open --cool-down over--> HalfOpen
///   ^                            ^                         |
///   |                            +------probe failed-------+
///   +-----------------------probe succeeded----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    /// One probe is allowed through to test recovery.
    HalfOpen,
}

/// Point-in-time view of a breaker for admin responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    ///
    /// A `threshold` of zero is treated as one.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Asks to send one request. A `true` from an open or half-open breaker claims the probe.
    ///
    /// A probe that never reports back is given up after one cool-down, after which the next
    /// caller may claim it. The closed case is answered under the read lock.
    pub async fn try_admit(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitBreakerState::Closed => return true,
                CircuitBreakerState::Open => {
                    if !self.cooldown_elapsed(inner.opened_at) {
                        return false;
                    }
                }
                CircuitBreakerState::HalfOpen => {
                    if self.probe_active(inner.probe_started_at) {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;

        // Re-check: the state may have moved while waiting for the write lock.
        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                if self.cooldown_elapsed(inner.opened_at) {
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.probe_started_at = Some(Instant::now());
                    tracing::info!("circuit breaker transitioning to half-open state");
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if self.probe_active(inner.probe_started_at) {
                    false
                } else {
                    inner.probe_started_at = Some(Instant::now());
                    true
                }
            }
        }
    }

    /// `true` while open and still cooling down. Never claims the probe.
    pub async fn is_open(&self) -> bool {
        let inner = self.inner.read().await;
        inner.state == CircuitBreakerState::Open && !self.cooldown_elapsed(inner.opened_at)
    }

    /// Clears the failure count; closes the breaker if it was open or half-open.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {
                inner.close();
                tracing::info!("circuit breaker closed");
            }
        }
    }

    /// Counts a failure. Opens at the threshold, or immediately when a half-open probe fails.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.threshold {
                    inner.open();
                    tracing::warn!(
                        threshold = self.threshold,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                inner.open();
                tracing::warn!("circuit breaker re-opened after failed probe");
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Forces the circuit closed and clears the failure count.
    pub async fn reset(&self) {
        self.inner.write().await.close();
        tracing::info!("circuit breaker reset");
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read().await;
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            opened_at: inner.opened_at_wall,
        }
    }

    fn cooldown_elapsed(&self, opened_at: Option<Instant>) -> bool {
        opened_at.is_some_and(|opened_at| opened_at.elapsed() >= self.cooldown)
    }

    fn probe_active(&self, probe_started_at: Option<Instant>) -> bool {
        probe_started_at.is_some_and(|started| started.elapsed() < self.cooldown)
    }
}
