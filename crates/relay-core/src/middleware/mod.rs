//! Request gates applied by the orchestrator before any upstream work.
//!
//! HTTP adapters (axum extractors, correlation ids, error responses) live in
//! `crates/server/src`; this module holds the protocol-independent checks.
//!
//! # Pipeline
//!
//! ```text
//!   FetchRequest
//!        │
//!        ▼
//!   ┌─────────────────────────┐
//!   │  1. VALIDATION          │  FetchRequest::validate()
//!   │     - method allowlist  │
//!   │     - absolute http(s)  │
//!   │     - header syntax     │
//!   └─────────────────────────┘
//!        │ ValidationError? ──> 400
//!        ▼
//!   ┌─────────────────────────┐
//!   │  2. KILL SWITCH         │  KillSwitch::check()
//!   │     - global flag       │  (before the cache lookup)
//!   │     - per-source set    │
//!   └─────────────────────────┘
//!        │ KillSwitchScope? ──> 503
//!        ▼
//!   cache lookup (hit returns here)
//!        │ miss / force_refresh
//!        ▼
//!   ┌─────────────────────────┐
//!   │  3. RATE LIMITING       │  RateLimiter::check()
//!   │     - fixed window      │
//!   │     - one rule / source │
//!   └─────────────────────────┘
//!        │ RateLimitExceeded? ──> 429 + Retry-After
//!        ▼
//!   upstream failover
//! ```
//!
//! Rate limiting only counts requests that would reach an upstream; cache hits are free.

pub mod kill_switch;
pub mod rate_limiting;
pub mod validation;

pub use kill_switch::{KillSwitch, KillSwitchScope, KillSwitchStatus};
pub use rate_limiting::{
    NewRateLimitRule, RateLimitError, RateLimitExceeded, RateLimitRuleUpdate, RateLimiter,
    WindowUsage,
};
pub use validation::{ValidationError, ALLOWED_METHODS};
