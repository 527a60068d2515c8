//! Request correlation ids.
//!
//! An incoming `x-request-id` is kept, otherwise a UUID v4 is generated. The id is echoed on the
//! response and recorded on the request's tracing span so that gateway logs, audit records and
//! client reports can be joined.

use axum::http::{header::HeaderValue, HeaderName, Request};
use std::sync::Arc;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tracing::Span;
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone, Debug)]
pub struct CorrelationId(pub Arc<str>);

impl CorrelationId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Reads the id assigned by [`SetRequestIdLayer`], if the layer ran and the header is
    /// valid UTF-8.
    #[must_use]
    pub fn from_request<B>(request: &Request<B>) -> Option<Self> {
        request
            .extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .map(Self::new)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A UUID v4 generator for tower-http's request id middleware.
#[derive(Clone, Copy, Default)]
pub struct UuidRequestIdGenerator;

impl MakeRequestId for UuidRequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(HeaderValue::from_str(&id).ok()?))
    }
}

/// Returns `(set, propagate)`. Apply `propagate` first so that it wraps the handler and `set`
/// runs before it.
#[must_use]
pub fn create_request_id_layers(
) -> (SetRequestIdLayer<UuidRequestIdGenerator>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::new(X_REQUEST_ID.clone(), UuidRequestIdGenerator),
        PropagateRequestIdLayer::new(X_REQUEST_ID.clone()),
    )
}

/// Span factory for `TraceLayer::make_span_with`.
pub fn request_span<B>(request: &Request<B>) -> Span {
    let request_id = CorrelationId::from_request(request);
    tracing::info_span!(
        "http_request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = request_id.as_ref().map_or("-", CorrelationId::as_str),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn echo_id(request: Request<Body>) -> String {
        CorrelationId::from_request(&request).map(|id| id.to_string()).unwrap_or_default()
    }

    fn create_test_app() -> Router {
        let (set_layer, propagate_layer) = create_request_id_layers();
        Router::new().route("/test", get(echo_id)).layer(propagate_layer).layer(set_layer)
    }

    #[tokio::test]
    async fn test_generates_correlation_id_when_missing() {
        let app = create_test_app();

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let header = response.headers().get(&X_REQUEST_ID).expect("should have correlation id");
        let id = header.to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok(), "generated id should be a UUID, got: {id}");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, id.as_bytes(), "handler should see the same id");
    }

    #[tokio::test]
    async fn test_preserves_existing_correlation_id() {
        let app = create_test_app();
        let custom_id = "client-supplied-42";

        let request = Request::builder()
            .uri("/test")
            .header(X_REQUEST_ID.clone(), custom_id)
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers().get(&X_REQUEST_ID).unwrap(), custom_id);
    }

    #[test]
    fn test_uuid_generator_is_unique() {
        let mut generator = UuidRequestIdGenerator;
        let request = Request::builder().body(()).unwrap();

        let id1 = generator.make_request_id(&request).unwrap();
        let id2 = generator.make_request_id(&request).unwrap();
        assert_ne!(id1.header_value(), id2.header_value());
    }

    #[test]
    fn test_missing_request_id_extension() {
        let request = Request::builder().body(()).unwrap();
        assert!(CorrelationId::from_request(&request).is_none());
    }
}
