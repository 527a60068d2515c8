//! Core type definitions for sources, endpoints, cache entries and fetch results.
//!
//! # Type Categories
//!
//! ## Upstream Topology
//! - [`Source`], [`Endpoint`]: a logical API and its prioritized base URLs
//! - [`AuthDescriptor`]: per-endpoint credentials as a tagged sum type
//! - [`StorageMode`], [`FallbackMode`]: caching scope and exhaustion behaviour
//!
//! ## Cache Data
//! - [`CacheEntry`]: a captured upstream response with soft expiry
//! - [`StoragePool`]: a shared cache namespace spanning several sources
//! - [`RateLimitRule`], [`CachePolicy`]: per-source governance inputs
//!
//! ## Request / Response
//! - [`FetchRequest`]: the logical API call submitted by a caller
//! - [`UpstreamResponse`]: status, headers and body as captured, see [`BodyEncoding`]
//! - [`FetchResult`], [`FetchMeta`]: the uniform result returned by the orchestrator

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a source's responses are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Private cache scoped to the source alone.
    #[default]
    Dedicated,
    /// Entries live in a [`StoragePool`] shared with other sources.
    Shared,
}

/// What to serve once every candidate endpoint of a source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Propagate the failure to the caller.
    #[default]
    None,
    /// Serve the source's configured mock payload.
    Mock,
    /// Serve the most recent cache entry for the key, even if expired.
    Stale,
}

impl FallbackMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mock => "mock",
            Self::Stale => "stale",
        }
    }
}

/// Where an API key credential is placed on the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// Credentials attached to every request sent to an endpoint.
///
/// Each variant carries only the fields it needs; [`AuthDescriptor::validate`] is called on
/// every write path so malformed descriptors never reach the upstream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        /// Header name or query parameter name, depending on `location`.
        name: String,
        value: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl AuthDescriptor {
    /// Checks that every required field of the variant is present.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing or malformed field.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::Bearer { token } => {
                if token.trim().is_empty() {
                    return Err("bearer auth requires a non-empty token".to_string());
                }
                Ok(())
            }
            Self::ApiKey { name, value, location } => {
                if name.trim().is_empty() || value.is_empty() {
                    return Err("api_key auth requires a name and a value".to_string());
                }
                if *location == ApiKeyLocation::Header &&
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err()
                {
                    return Err(format!("'{name}' is not a valid header name"));
                }
                Ok(())
            }
            Self::Basic { username, .. } => {
                if username.is_empty() {
                    return Err("basic auth requires a username".to_string());
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer { .. } => "bearer",
            Self::ApiKey { .. } => "api_key",
            Self::Basic { .. } => "basic",
        }
    }

    /// Returns a copy with secrets replaced, safe for API responses and logs.
    #[must_use]
    pub fn redacted(&self) -> Self {
        const MASK: &str = "***";
        match self {
            Self::None => Self::None,
            Self::Bearer { .. } => Self::Bearer { token: MASK.to_string() },
            Self::ApiKey { name, location, .. } => {
                Self::ApiKey { name: name.clone(), value: MASK.to_string(), location: *location }
            }
            Self::Basic { username, .. } => {
                Self::Basic { username: username.clone(), password: MASK.to_string() }
            }
        }
    }
}

/// A logical named upstream API, backed by one or more [`Endpoint`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub storage_mode: StorageMode,
    /// Required iff `storage_mode` is [`StorageMode::Shared`].
    pub pool_id: Option<String>,
    pub cost_per_request: f64,
    pub is_active: bool,
    pub bypass_bot_detection: bool,
    /// Payload served by [`FallbackMode::Mock`].
    pub mock_response: Option<UpstreamResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Cache scope that entries written for this source belong to.
    #[must_use]
    pub fn cache_scope(&self) -> crate::cache::CacheScope {
        match (&self.storage_mode, &self.pool_id) {
            (StorageMode::Shared, Some(pool_id)) => crate::cache::CacheScope::Pool(pool_id.clone()),
            _ => crate::cache::CacheScope::Dedicated { source_id: Some(self.id.clone()) },
        }
    }
}

/// One base URL of a [`Source`] with its own auth, timeout, retry and breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub source_id: String,
    pub base_url: String,
    pub auth: AuthDescriptor,
    /// Ascending: lower values are attempted first.
    pub priority: u32,
    pub timeout_ms: u64,
    /// Additional attempts on the same endpoint after a failure.
    pub retry_count: u32,
    pub circuit_breaker_threshold: u32,
    pub fallback_mode: FallbackMode,
    pub is_active: bool,
}

/// How [`UpstreamResponse::body`] represents the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    /// Standard base64 of a payload that is not valid UTF-8.
    Base64,
}

impl BodyEncoding {
    #[must_use]
    pub fn is_utf8(&self) -> bool {
        matches!(self, Self::Utf8)
    }
}

/// Status, headers and body of an HTTP response as captured from an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BodyEncoding::is_utf8")]
    pub body_encoding: BodyEncoding,
}

impl UpstreamResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }

    /// The payload as raw bytes, decoding a base64 body.
    ///
    /// # Errors
    ///
    /// Returns the decode error when a base64 body is malformed.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.body_encoding {
            BodyEncoding::Utf8 => Ok(self.body.as_bytes().to_vec()),
            BodyEncoding::Base64 => base64::engine::general_purpose::STANDARD.decode(&self.body),
        }
    }
}

/// A captured upstream response.
///
/// Expiry is a soft marker: an entry past `expires_at` is a miss for serving purposes but stays
/// in the store for stale fallback and inspection until it is invalidated, purged or cleaned up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: u64,
    pub cache_key: String,
    pub source_id: Option<String>,
    /// `None` for dedicated (source-private or unmanaged) entries.
    pub pool_id: Option<String>,
    pub request_method: String,
    pub request_url: String,
    pub response: UpstreamResponse,
    /// `0` means the entry never expires.
    pub ttl_seconds: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => self.ttl_seconds != 0 && expires_at <= now,
            None => false,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.response.size_bytes()
    }
}

/// Computes the expiry instant for a TTL.
///
/// `0` never expires, and neither does a TTL reaching past the representable date range.
#[must_use]
pub fn expiry_for(now: DateTime<Utc>, ttl_seconds: u64) -> Option<DateTime<Utc>> {
    if ttl_seconds == 0 {
        return None;
    }
    i64::try_from(ttl_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// A named shared cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    /// A dedicated pool accepts at most one member source.
    pub dedicated: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-source throughput limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    pub source_id: String,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub enabled: bool,
}

/// Per-source caching constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub id: String,
    pub source_id: String,
    /// TTL ceiling; `None` means no cap.
    pub max_ttl_seconds: Option<u64>,
    /// Responses are returned but never written to the cache.
    pub no_cache: bool,
    /// Cron-like schedule owned by an external scheduler.
    pub purge_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A logical API call submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute URL, or a path relative to the source when `source` is set.
    pub url: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub force_refresh: bool,
    /// Requested TTL in seconds; the configured default applies when absent.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Source id or name; resolved from the URL when absent.
    #[serde(default)]
    pub source: Option<String>,
    /// Treat 4xx upstream responses as failures instead of valid results.
    #[serde(default)]
    pub strict: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            body: None,
            headers: None,
            force_refresh: false,
            ttl: None,
            source: None,
            strict: false,
        }
    }

    /// Serialized request body: strings are sent verbatim, other JSON values as JSON text.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        match &self.body {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(value) => Some(value.to_string()),
        }
    }
}

/// Metadata describing how a [`FetchResult`] was produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FetchMeta {
    pub hit_count: u64,
    pub ttl_seconds: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_hit_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Endpoint that produced the response, when it came from upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub stale: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub is_mock: bool,
    /// Served by a non-primary endpoint or by a fallback mode.
    #[serde(skip_serializing_if = "is_false")]
    pub fallback: bool,
    /// The response was not persisted because the source's policy disables caching.
    #[serde(skip_serializing_if = "is_false")]
    pub no_cache: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Uniform result of the fetch-or-serve pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub cached: bool,
    pub cache_key: String,
    pub response: UpstreamResponse,
    pub meta: FetchMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl_seconds: u64, expires_at: Option<DateTime<Utc>>) -> CacheEntry {
        CacheEntry {
            id: 1,
            cache_key: "k".to_string(),
            source_id: None,
            pool_id: None,
            request_method: "GET".to_string(),
            request_url: "https://api.example.com".to_string(),
            response: UpstreamResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: "{}".to_string(),
                content_type: None,
                body_encoding: BodyEncoding::Utf8,
            },
            ttl_seconds,
            expires_at,
            hit_count: 0,
            created_at: Utc::now(),
            last_hit_at: None,
        }
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let now = Utc::now();
        assert!(expiry_for(now, 0).is_none());
        let e = entry(0, None);
        assert!(!e.is_expired_at(now + chrono::Duration::days(3650)));
    }

    #[test]
    fn test_out_of_range_ttl_never_expires() {
        let now = Utc::now();
        for ttl in [u64::MAX, u64::MAX / 2, 100_000_000_000_000_000, 10_000_000_000_000] {
            assert!(expiry_for(now, ttl).is_none(), "ttl {ttl}");
        }
        let e = entry(u64::MAX, expiry_for(now, u64::MAX));
        assert!(!e.is_expired_at(now + chrono::Duration::days(365_000)));
        assert!(expiry_for(now, 86_400).is_some());
    }

    #[test]
    fn test_expiry_is_soft_boundary() {
        let now = Utc::now();
        let e = entry(60, expiry_for(now, 60));
        assert!(!e.is_expired_at(now));
        assert!(e.is_expired_at(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_auth_descriptor_tagged_serde() {
        let auth: AuthDescriptor =
            serde_json::from_str(r#"{"type":"api_key","name":"x-api-key","value":"s3cret"}"#)
                .unwrap();
        assert_eq!(
            auth,
            AuthDescriptor::ApiKey {
                name: "x-api-key".to_string(),
                value: "s3cret".to_string(),
                location: ApiKeyLocation::Header,
            }
        );
        assert!(auth.validate().is_ok());

        let missing: Result<AuthDescriptor, _> = serde_json::from_str(r#"{"type":"bearer"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_auth_descriptor_validation() {
        assert!(AuthDescriptor::Bearer { token: "  ".to_string() }.validate().is_err());
        assert!(AuthDescriptor::ApiKey {
            name: "bad header".to_string(),
            value: "v".to_string(),
            location: ApiKeyLocation::Header,
        }
        .validate()
        .is_err());
        assert!(AuthDescriptor::ApiKey {
            name: "api key".to_string(),
            value: "v".to_string(),
            location: ApiKeyLocation::Query,
        }
        .validate()
        .is_ok());
        assert!(AuthDescriptor::Basic { username: String::new(), password: "p".to_string() }
            .validate()
            .is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let auth = AuthDescriptor::Basic { username: "u".to_string(), password: "p".to_string() };
        assert_eq!(
            auth.redacted(),
            AuthDescriptor::Basic { username: "u".to_string(), password: "***".to_string() }
        );
    }

    #[test]
    fn test_body_text() {
        let mut request = FetchRequest::get("https://api.example.com");
        assert_eq!(request.body_text(), None);
        request.body = Some(serde_json::json!("raw"));
        assert_eq!(request.body_text().as_deref(), Some("raw"));
        request.body = Some(serde_json::json!({"b": 1, "a": 2}));
        assert_eq!(request.body_text().as_deref(), Some(r#"{"a":2,"b":1}"#));
    }
}
