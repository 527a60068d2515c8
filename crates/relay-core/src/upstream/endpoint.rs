use base64::Engine;
use bytes::Bytes;
use reqwest::{
    header::{
        HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, USER_AGENT,
    },
    Method,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use url::Url;

use crate::{
    types::{ApiKeyLocation, AuthDescriptor, Endpoint, UpstreamResponse},
    upstream::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot},
        http_client::{header_map_from, HttpClient, OutboundRequest},
    },
};

use super::errors::UpstreamError;

const ALTERNATE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                    (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const ALTERNATE_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7";

/// Header set applied on top of the caller's headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProfile {
    /// The client's own user agent.
    Standard,
    /// Browser-like headers used to retry once after a challenge page.
    Alternate,
}

/// The parts of a logical request that are the same for every endpoint of a source.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub method: Method,
    /// Path and query re-rooted onto each endpoint's base URL.
    pub suffix: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

/// An [`Endpoint`] bound to its circuit breaker and the shared HTTP client.
pub struct UpstreamEndpoint {
    config: Endpoint,
    circuit_breaker: Arc<CircuitBreaker>,
    http_client: Arc<HttpClient>,
}

impl UpstreamEndpoint {
    #[must_use]
    pub fn new(config: Endpoint, http_client: Arc<HttpClient>, breaker_cooldown: Duration) -> Self {
        let circuit_breaker =
            Arc::new(CircuitBreaker::new(config.circuit_breaker_threshold, breaker_cooldown));
        Self { config, circuit_breaker, http_client }
    }

    #[must_use]
    pub fn config(&self) -> &Endpoint {
        &self.config
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub async fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.circuit_breaker.snapshot().await
    }

    /// Sends one attempt to this endpoint.
    ///
    /// The circuit breaker is neither consulted nor updated here; the failover loop owns both
    /// so that a challenge retry is not double counted.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] if the URL or headers cannot be built, or any
    /// transport error from the HTTP client.
    pub async fn send(
        &self,
        call: &UpstreamCall,
        profile: HeaderProfile,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut url = Url::parse(&join_url(&self.config.base_url, &call.suffix))
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid upstream url: {e}")))?;

        let mut headers = header_map_from(&call.headers);
        apply_profile(&mut headers, profile);
        apply_auth(&self.config.auth, &mut headers, &mut url)?;

        tracing::debug!(
            endpoint = %self.config.id,
            method = %call.method,
            url = %redact_query(&url),
            profile = ?profile,
            "sending upstream request"
        );

        self.http_client
            .send(OutboundRequest {
                method: call.method.clone(),
                url: url.into(),
                headers,
                body: call.body.clone(),
                timeout: Duration::from_millis(self.config.timeout_ms.max(1)),
            })
            .await
    }
}

/// Appends a path/query suffix to a base URL without doubling or dropping slashes.
#[must_use]
pub fn join_url(base_url: &str, suffix: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else if suffix.starts_with('/') || suffix.starts_with('?') {
        format!("{base}{suffix}")
    } else {
        format!("{base}/{suffix}")
    }
}

fn apply_profile(headers: &mut HeaderMap, profile: HeaderProfile) {
    if profile == HeaderProfile::Alternate {
        headers.insert(USER_AGENT, HeaderValue::from_static(ALTERNATE_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(ALTERNATE_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    }
}

fn apply_auth(
    auth: &AuthDescriptor,
    headers: &mut HeaderMap,
    url: &mut Url,
) -> Result<(), UpstreamError> {
    let invalid =
        |e: &dyn std::fmt::Display| UpstreamError::InvalidRequest(format!("invalid auth: {e}"));

    match auth {
        AuthDescriptor::None => {}
        AuthDescriptor::Bearer { token } => {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| invalid(&e))?;
            headers.insert(AUTHORIZATION, value);
        }
        AuthDescriptor::ApiKey { name, value, location: ApiKeyLocation::Header } => {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
            headers.insert(name, value);
        }
        AuthDescriptor::ApiKey { name, value, location: ApiKeyLocation::Query } => {
            url.query_pairs_mut().append_pair(name, value);
        }
        AuthDescriptor::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            let value =
                HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|e| invalid(&e))?;
            headers.insert(AUTHORIZATION, value);
        }
    }
    Ok(())
}

/// URL with query values masked, for logs.
fn redact_query(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    redacted.query_pairs_mut().clear().extend_pairs(keys.iter().map(|k| (k.as_str(), "***")));
    redacted.to_string()
}
