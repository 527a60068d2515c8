//! # Relay Core
//!
//! Core library for Relay, a caching, resilience and cost-control gateway placed in front of
//! third-party HTTP APIs.
//!
//! - **[`cache`]**: deterministic cache keys, the pool-scoped response store with soft expiry,
//!   per-source cache policies, storage pools and in-flight request coalescing.
//!
//! - **[`upstream`]**: sources and their prioritized endpoints, per-endpoint circuit breakers,
//!   the shared HTTP client and the retry/failover loop.
//!
//! - **[`middleware`]**: request validation, fixed-window rate limiting and kill switches.
//!
//! - **[`proxy`]**: the [`RequestOrchestrator`](proxy::RequestOrchestrator) composing all of
//!   the above into one fetch-or-serve pipeline.
//!
//! - **[`metrics`]**: Prometheus metrics plus in-memory hit, miss and cost counters.
//!
//! - **[`events`]**: broadcast bus for audit consumers.
//!
//! - **[`config`]** and **[`runtime`]**: layered configuration, seeding and lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       RequestOrchestrator                        │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────────┐  ┌─────────┐  │
//! │  │ KillSwitch │  │ RateLimiter  │  │ CacheStore  │  │ Metrics │  │
//! │  └────────────┘  └──────────────┘  └──────┬──────┘  └────┬────┘  │
//! │                                           │              │       │
//! │  ┌────────────────┐  ┌────────────────┐  ┌▼─────────────┐│       │
//! │  │ SourceRegistry │  │ PolicyEnforcer │  │ StoragePools ││       │
//! │  │  endpoints +   │  └────────────────┘  └──────────────┘│       │
//! │  │  breakers      │                             ┌────────▼─────┐ │
//! │  └───────┬────────┘                             │  Prometheus  │ │
//! │          ▼                                      │   Exporter   │ │
//! │  ┌────────────────┐   ┌────────────┐            └──────────────┘ │
//! │  │FailoverExecutor│──►│ HttpClient │                             │
//! │  └────────────────┘   └────────────┘                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod events;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod runtime;
pub mod types;
pub mod upstream;
