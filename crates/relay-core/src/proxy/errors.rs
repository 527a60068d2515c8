use crate::{
    middleware::{kill_switch::KillSwitchScope, validation::ValidationError},
    upstream::errors::UpstreamError,
};

/// Caller-facing failures of the fetch pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed request; never retried.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Rejected before the cache lookup by an operator kill switch.
    #[error("Kill switch active ({scope})")]
    KillSwitchActive { scope: KillSwitchScope },

    #[error("Rate limit exceeded for source '{source_id}', retry after {retry_after_secs}s")]
    RateLimitExceeded { source_id: String, retry_after_secs: u64 },

    /// Every candidate endpoint failed and no fallback applied.
    ///
    /// Preserves the last concrete `UpstreamError` for logging and status mapping.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Every endpoint of the source had an open circuit and no fallback applied.
    #[error("All circuit breakers open for source '{source_id}'")]
    AllCircuitsOpen { source_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Seconds the caller should wait before retrying, when known.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_kill_switch(&self) -> bool {
        matches!(self, Self::KillSwitchActive { .. })
    }
}
