//! Maps core errors onto HTTP responses.
//!
//! | Error | Status |
//! |-------|--------|
//! | validation, malformed admin input | 400 |
//! | unknown resource | 404 |
//! | duplicate resource, non-empty pool | 409 |
//! | rate limit exceeded | 429 + `Retry-After` |
//! | kill switch active, all circuits open | 503 |
//! | upstream exhausted | 502 |

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use relay_core::{
    cache::{PolicyError, PoolError},
    metrics::MetricsState,
    middleware::RateLimitError,
    proxy::ProxyError,
    upstream::RegistryError,
};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Proxy(ProxyError),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Proxy(error) => match error {
                ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
                ProxyError::KillSwitchActive { .. } | ProxyError::AllCircuitsOpen { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Proxy(error) => error.as_metric_str(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(message) | Self::NotFound(message) | Self::Conflict(message) => {
                f.write_str(message)
            }
            Self::Proxy(error) => write!(f, "{error}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": { "code": self.code(), "message": self.to_string() },
        });

        let retry_after = match &self {
            Self::Proxy(ProxyError::KillSwitchActive { scope }) => {
                body["cached"] = json!(false);
                body["meta"] = json!({ "kill_switch": true, "scope": scope });
                None
            }
            Self::Proxy(error) => error.retry_after_secs(),
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            set_retry_after(&mut response, secs);
        }
        response
    }
}

fn set_retry_after(response: &mut Response, secs: u64) {
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
}

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        Self::Proxy(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::SourceNotFound(_) | RegistryError::EndpointNotFound(_) => {
                Self::NotFound(error.to_string())
            }
            RegistryError::Conflict(_) | RegistryError::DedicatedPoolOccupied { .. } => {
                Self::Conflict(error.to_string())
            }
            _ => Self::BadRequest(error.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Registry(inner) => inner.into(),
            PoolError::NotFound(_) => Self::NotFound(error.to_string()),
            PoolError::Conflict(_) | PoolError::NotEmpty { .. } => {
                Self::Conflict(error.to_string())
            }
            _ => Self::BadRequest(error.to_string()),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::NotFound(_) => Self::NotFound(error.to_string()),
            PolicyError::Conflict { .. } => Self::Conflict(error.to_string()),
            _ => Self::BadRequest(error.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(error: RateLimitError) -> Self {
        match error {
            RateLimitError::NotFound(_) => Self::NotFound(error.to_string()),
            RateLimitError::Conflict { .. } => Self::Conflict(error.to_string()),
            _ => Self::BadRequest(error.to_string()),
        }
    }
}
