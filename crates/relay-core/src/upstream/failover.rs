//! Ordered failover across a source's candidate endpoints.
//!
//! Each endpoint is tried in priority order. Transient failures (timeouts, connection errors,
//! 5xx responses) are retried on the same endpoint up to its `retry_count` with capped
//! exponential backoff before moving on. 4xx responses are valid results unless strict mode is
//! requested. A challenge page is retried once with the alternate header profile when the
//! source opts into bot-detection bypass; only a second challenge counts as a failure.
//!
//! Circuit breakers are consulted before every attempt and updated after it, so an endpoint
//! that trips mid-request is abandoned without further attempts.

use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    types::UpstreamResponse,
    upstream::{
        endpoint::{HeaderProfile, UpstreamCall, UpstreamEndpoint},
        errors::UpstreamError,
    },
};

const CHALLENGE_STATUSES: &[u16] = &[403, 429, 503];

const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "captcha",
    "just a moment",
    "attention required",
    "checking your browser",
];

/// Capped exponential backoff between attempts on the same endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_backoff: Duration::from_millis(100), max_backoff: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1 << exponent).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailoverOptions {
    /// Treat 4xx responses as failures.
    pub strict: bool,
    /// Retry challenge pages once with the alternate header profile.
    pub bypass_bot_detection: bool,
}

/// One upstream attempt, for metrics and logs.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub endpoint_id: String,
    pub status: Option<u16>,
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Clone)]
pub struct FailoverSuccess {
    pub response: UpstreamResponse,
    pub endpoint_id: String,
    /// Index of the serving endpoint in the candidate list; `0` is the preferred endpoint.
    pub position: usize,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone)]
pub struct FailoverExhausted {
    pub last_error: Option<UpstreamError>,
    pub attempts: Vec<AttemptRecord>,
}

impl FailoverExhausted {
    /// `true` when every candidate was refused by its circuit breaker before any attempt.
    #[must_use]
    pub fn all_circuits_open(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailoverExecutor {
    retry: RetryPolicy,
}

impl FailoverExecutor {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Runs the attempt loop over `endpoints` in order.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverExhausted`] when no endpoint produced an acceptable response.
    pub async fn execute(
        &self,
        endpoints: &[Arc<UpstreamEndpoint>],
        call: &UpstreamCall,
        options: FailoverOptions,
    ) -> Result<FailoverSuccess, FailoverExhausted> {
        let mut attempts = Vec::new();
        let mut last_error = None;

        for (position, endpoint) in endpoints.iter().enumerate() {
            let breaker = endpoint.circuit_breaker();
            let retry_limit = endpoint.config().retry_count;
            let mut retries = 0;

            loop {
                if !breaker.try_admit().await {
                    debug!(endpoint = %endpoint.id(), "circuit open, skipping endpoint");
                    last_error.get_or_insert(UpstreamError::CircuitBreakerOpen);
                    break;
                }

                match Self::attempt(endpoint, call, options).await {
                    Ok(response) => {
                        breaker.record_success().await;
                        attempts.push(AttemptRecord {
                            endpoint_id: endpoint.id().to_string(),
                            status: Some(response.status),
                            error: None,
                        });
                        return Ok(FailoverSuccess {
                            response,
                            endpoint_id: endpoint.id().to_string(),
                            position,
                            attempts,
                        });
                    }
                    Err(error) => {
                        if error.should_trip_breaker() {
                            breaker.record_failure().await;
                        }
                        let status = match &error {
                            UpstreamError::ServerError(status) |
                            UpstreamError::ClientError(status) |
                            UpstreamError::ChallengeDetected(status) => Some(*status),
                            _ => None,
                        };
                        attempts.push(AttemptRecord {
                            endpoint_id: endpoint.id().to_string(),
                            status,
                            error: Some(error.clone()),
                        });

                        let retry = error.is_transient() && retries < retry_limit;
                        warn!(
                            endpoint = %endpoint.id(),
                            error = %error,
                            retry = retries,
                            will_retry = retry,
                            "upstream attempt failed"
                        );
                        last_error = Some(error);

                        if !retry {
                            break;
                        }
                        retries += 1;
                        tokio::time::sleep(self.retry.backoff(retries)).await;
                    }
                }
            }
        }

        Err(FailoverExhausted { last_error, attempts })
    }

    async fn attempt(
        endpoint: &UpstreamEndpoint,
        call: &UpstreamCall,
        options: FailoverOptions,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut response = endpoint.send(call, HeaderProfile::Standard).await?;

        if options.bypass_bot_detection && is_challenge_page(&response) {
            debug!(
                endpoint = %endpoint.id(),
                status = response.status,
                "challenge page detected, retrying with alternate profile"
            );
            response = endpoint.send(call, HeaderProfile::Alternate).await?;
            if is_challenge_page(&response) {
                return Err(UpstreamError::ChallengeDetected(response.status));
            }
        }

        classify(response, options.strict)
    }
}

/// Applies the failure rules to a completed exchange: 5xx always fails, 4xx only when strict.
///
/// # Errors
///
/// Returns [`UpstreamError::ServerError`] or, in strict mode, [`UpstreamError::ClientError`].
pub fn classify(
    response: UpstreamResponse,
    strict: bool,
) -> Result<UpstreamResponse, UpstreamError> {
    if response.is_server_error() {
        Err(UpstreamError::ServerError(response.status))
    } else if strict && response.is_client_error() {
        Err(UpstreamError::ClientError(response.status))
    } else {
        Ok(response)
    }
}

/// Heuristic for anti-bot interstitials: a blocking status plus a known marker.
#[must_use]
pub fn is_challenge_page(response: &UpstreamResponse) -> bool {
    if !CHALLENGE_STATUSES.contains(&response.status) {
        return false;
    }
    if response.headers.get("cf-mitigated").is_some_and(|v| v.eq_ignore_ascii_case("challenge")) {
        return true;
    }
    let body = response.body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}
