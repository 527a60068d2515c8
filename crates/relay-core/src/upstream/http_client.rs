use base64::Engine;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, ClientBuilder, Method,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    types::{BodyEncoding, UpstreamResponse},
    upstream::UpstreamError,
};

/// Response bodies above this many bytes are rejected unless configured otherwise.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Response headers that describe the connection rather than the payload; never captured.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Configuration for HTTP client concurrency and timeout behavior.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests allowed
    pub concurrent_limit: usize,
    /// Permit acquisition timeout in milliseconds
    pub permit_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Largest response body read before the exchange is abandoned
    pub max_response_bytes: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 512,
            permit_timeout_ms: 500,
            connect_timeout_ms: 5_000,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: concat!("relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A fully resolved outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Hard deadline for the whole exchange, body included.
    pub timeout: Duration,
}

/// HTTP client with semaphore-based concurrency control.
///
/// Every non-2xx status is returned as a regular [`UpstreamResponse`]; only transport-level
/// problems become errors. Retrying is the caller's concern.
pub struct HttpClient {
    client: Client,
    concurrent_limit: Arc<Semaphore>,
    config: HttpClientConfig,
}

/// RAII guard ensuring semaphore permits are always released.
struct PermitGuard {
    _permit: OwnedSemaphorePermit,
    semaphore: Arc<Semaphore>,
}

impl PermitGuard {
    fn new(permit: OwnedSemaphorePermit, semaphore: Arc<Semaphore>) -> Self {
        Self { _permit: permit, semaphore }
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        tracing::trace!(
            available_permits = self.semaphore.available_permits(),
            "permit guard dropped"
        );
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_config(HttpClientConfig::default())
    }

    /// Sanitizes network errors to prevent information disclosure.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_redirect() {
            "too many redirects".to_string()
        } else {
            "network error".to_string()
        }
    }

    /// Creates a new HTTP client with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(config.user_agent.clone())
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            client,
            concurrent_limit: Arc::new(Semaphore::new(config.concurrent_limit.max(1))),
            config,
        })
    }

    /// Sends a request and captures the response, whatever its status.
    ///
    /// The exchange, including reading the body, is bounded by `request.timeout`; on expiry the
    /// in-flight future is dropped, which cancels the call.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::Timeout`] if the deadline passes
    /// - [`UpstreamError::ConcurrencyLimit`] if no permit becomes available in time
    /// - [`UpstreamError::ConnectionFailed`] for transport failures
    /// - [`UpstreamError::InvalidResponse`] if the body cannot be read or exceeds the size cap
    pub async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, UpstreamError> {
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.permit_timeout_ms),
            Arc::clone(&self.concurrent_limit).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                available_permits = self.concurrent_limit.available_permits(),
                "http client semaphore acquisition timeout"
            );
            UpstreamError::ConcurrencyLimit(request.url.clone())
        })?
        .map_err(|_| UpstreamError::ConcurrencyLimit(request.url.clone()))?;

        let _permit_guard = PermitGuard::new(permit, self.concurrent_limit.clone());
        let deadline = request.timeout;

        match tokio::time::timeout(deadline, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(timeout_ms = deadline.as_millis(), "upstream call timed out");
                Err(UpstreamError::Timeout)
            }
        }
    }

    async fn exchange(&self, request: OutboundRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut builder =
            self.client.request(request.method, &request.url).headers(request.headers);
        if let Some(body) = request.body {
            // Bytes::clone() is O(1) so callers can retry without copying
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::ConnectionFailed(Self::sanitize_network_error(&e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = capture_headers(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = self.read_body(response).await?;
        let (body, body_encoding) = match String::from_utf8(body) {
            Ok(text) => (text, BodyEncoding::Utf8),
            Err(e) => (
                base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
                BodyEncoding::Base64,
            ),
        };

        Ok(UpstreamResponse { status, headers, body, content_type, body_encoding })
    }

    /// Reads the body chunk by chunk, refusing anything above `max_response_bytes`.
    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, UpstreamError> {
        let limit = self.config.max_response_bytes;
        let too_large = || {
            tracing::debug!(limit, "upstream response body over size cap");
            UpstreamError::InvalidResponse(format!("response body exceeds {limit} bytes"))
        };

        if let Some(declared) = response.content_length() {
            if u64::try_from(limit).is_ok_and(|limit| declared > limit) {
                return Err(too_large());
            }
        }

        let mut body = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::InvalidResponse(Self::sanitize_network_error(&e))
                }
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.concurrent_limit.available_permits()
    }
}

/// Lowercased, hop-by-hop-free copy of response headers; repeated headers are comma-joined.
fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        captured
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    captured
}

/// Converts caller-supplied headers, skipping hop-by-hop and malformed entries.
#[must_use]
pub fn header_map_from(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.trim().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) ||
            lower == "host" ||
            lower == "content-length"
        {
            continue;
        }
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(lower.as_bytes()), HeaderValue::from_str(value.trim()))
        {
            map.insert(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request(url: String, timeout: Duration) -> OutboundRequest {
        OutboundRequest { method: Method::GET, url, headers: HeaderMap::new(), body: None, timeout }
    }

    #[test]
    fn test_http_client_new() {
        let client = HttpClient::new();
        assert!(client.is_ok(), "HttpClient::new() should succeed");
    }

    #[test]
    fn test_header_map_drops_hop_by_hop() {
        let headers: BTreeMap<String, String> = [
            ("Accept".to_string(), "application/json".to_string()),
            ("Connection".to_string(), "close".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]
        .into_iter()
        .collect();
        let map = header_map_from(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("accept").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_non_success_status_is_returned_as_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_header("X-Trace", "abc")
            .with_body(r#"{"error":"not found"}"#)
            .create_async()
            .await;

        let client = HttpClient::new().unwrap();
        let response = client
            .send(request(format!("{}/missing", server.url()), Duration::from_secs(5)))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 404);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.headers.get("x-trace").map(String::as_str), Some("abc"));
        assert_eq!(response.body, r#"{"error":"not found"}"#);
        assert_eq!(client.available_permits(), HttpClientConfig::default().concurrent_limit);
    }

    #[tokio::test]
    async fn test_binary_body_is_kept_as_base64() {
        let payload: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0x00, 0xff, 0xfe, 0x10];
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/logo.png")
            .with_header("content-type", "image/png")
            .with_body(payload.clone())
            .create_async()
            .await;

        let client = HttpClient::new().unwrap();
        let response = client
            .send(request(format!("{}/logo.png", server.url()), Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(response.body_encoding, BodyEncoding::Base64);
        assert_eq!(response.body_bytes().unwrap(), payload);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["body_encoding"], "base64");
    }

    #[tokio::test]
    async fn test_text_body_stays_utf8() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/greeting").with_body("héllo").create_async().await;

        let client = HttpClient::new().unwrap();
        let response = client
            .send(request(format!("{}/greeting", server.url()), Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(response.body, "héllo");
        assert!(response.body_encoding.is_utf8());
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("body_encoding").is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/declared").with_body(vec![b'x'; 64]).create_async().await;
        server
            .mock("GET", "/streamed")
            .with_chunked_body(|w| w.write_all(&[b'y'; 64]))
            .create_async()
            .await;

        let client = HttpClient::with_config(HttpClientConfig {
            max_response_bytes: 16,
            ..HttpClientConfig::default()
        })
        .unwrap();

        for path in ["/declared", "/streamed"] {
            let result = client
                .send(request(format!("{}{path}", server.url()), Duration::from_secs(5)))
                .await;
            let Err(UpstreamError::InvalidResponse(message)) = result else {
                panic!("expected size rejection for {path}, got {result:?}");
            };
            assert!(message.contains("16 bytes"));
        }
        assert_eq!(client.available_permits(), HttpClientConfig::default().concurrent_limit);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = HttpClient::new().unwrap();
        let result =
            client.send(request("http://127.0.0.1:9/".to_string(), Duration::from_secs(5))).await;
        assert!(matches!(result, Err(UpstreamError::ConnectionFailed(_) | UpstreamError::Timeout)));
    }
}
