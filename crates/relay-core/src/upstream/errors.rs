use thiserror::Error;

/// Errors produced while talking to an upstream endpoint.
///
/// Non-2xx responses are not errors at this layer: the HTTP client returns them as
/// [`UpstreamResponse`](crate::types::UpstreamResponse)s and the failover loop decides whether a
/// status counts as a failure. [`UpstreamError::ServerError`] and
/// [`UpstreamError::ClientError`] record that decision once it has been made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The call exceeded the endpoint's timeout and was cancelled.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish a connection to the upstream endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The endpoint answered with a 5xx status.
    #[error("Upstream server error: HTTP {0}")]
    ServerError(u16),

    /// The endpoint answered with a 4xx status while strict mode was requested.
    #[error("Upstream client error: HTTP {0}")]
    ClientError(u16),

    /// The endpoint kept serving a bot-challenge page after the alternate header profile.
    #[error("Challenge page detected: HTTP {0}")]
    ChallengeDetected(u16),

    /// The response body could not be read.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Circuit breaker is open, blocking requests to protect the upstream.
    #[error("Circuit breaker is open")]
    CircuitBreakerOpen,

    /// The source has no active endpoints.
    #[error("No endpoints available")]
    NoEndpoints,

    /// Outbound request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Maximum concurrent requests limit has been reached.
    #[error("Concurrency limit reached: {0}")]
    ConcurrencyLimit(String),
}

impl UpstreamError {
    /// Returns `true` if retrying the same endpoint may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout |
                Self::ConnectionFailed(_) |
                Self::ServerError(_) |
                Self::ChallengeDetected(_) |
                Self::InvalidResponse(_) |
                Self::ConcurrencyLimit(_)
        )
    }

    /// Returns `true` if the error counts against the endpoint's circuit breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout |
                Self::ConnectionFailed(_) |
                Self::ServerError(_) |
                Self::ClientError(_) |
                Self::ChallengeDetected(_) |
                Self::InvalidResponse(_)
        )
    }
}
