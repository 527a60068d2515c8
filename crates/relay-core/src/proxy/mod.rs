//! The request pipeline that turns a [`FetchRequest`](crate::types::FetchRequest) into a
//! [`FetchResult`](crate::types::FetchResult).
//!
//! # Request Processing Flow
//!
//! ```text
//! FetchRequest
//!       │
//!       ▼
//! ┌──────────────┐
//! │  Validation  │ ─── invalid / unknown source ──► ProxyError::Validation
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ Kill switch  │ ─── active ──► ProxyError::KillSwitchActive
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ Cache lookup │ ─── hit ──► FetchResult { cached: true }
//! └──────┬───────┘
//!        │ miss / force_refresh
//!        ▼
//! ┌──────────────┐
//! │  Rate limit  │ ─── window full ──► ProxyError::RateLimitExceeded
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐     exhausted     ┌────────────────┐
//! │   Failover   │ ────────────────► │ Fallback mode  │ ──► stale / mock / error
//! └──────┬───────┘                   └────────────────┘
//!        ▼
//! ┌──────────────┐
//! │ Cache policy │ ──► store (ttl clamped) or skip
//! └──────────────┘
//! ```

pub mod errors;
pub mod orchestrator;

pub use errors::ProxyError;
pub use orchestrator::{OrchestratorConfig, OrchestratorParts, RequestOrchestrator};
