use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::types::FetchRequest;

/// HTTP methods accepted for upstream fetches.
pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

const MAX_URL_LENGTH: usize = 8_192;

impl FetchRequest {
    /// Validates a fetch request before any cache or upstream work.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the request fails validation checks:
    /// - [`ValidationError::MethodNotAllowed`] for methods outside [`ALLOWED_METHODS`]
    /// - [`ValidationError::EmptyUrl`] / [`ValidationError::UrlTooLong`]
    /// - [`ValidationError::RelativeUrlWithoutSource`] for a path without a `source`
    /// - [`ValidationError::InvalidUrl`] / [`ValidationError::UnsupportedScheme`]
    /// - [`ValidationError::InvalidHeader`] for malformed header names or values
    pub fn validate(&self) -> Result<(), ValidationError> {
        let method = self.method.trim().to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(ValidationError::MethodNotAllowed(self.method.clone()));
        }

        let url = self.url.trim();
        if url.is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        if url.len() > MAX_URL_LENGTH {
            return Err(ValidationError::UrlTooLong(url.len()));
        }

        if url.starts_with('/') {
            if self.source.is_none() {
                return Err(ValidationError::RelativeUrlWithoutSource(url.to_string()));
            }
        } else {
            let parsed = Url::parse(url).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::UnsupportedScheme(parsed.scheme().to_string()));
            }
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(ValidationError::InvalidUrl("missing host".to_string()));
            }
        }

        if let Some(headers) = &self.headers {
            for (name, value) in headers {
                if HeaderName::from_bytes(name.trim().as_bytes()).is_err() ||
                    HeaderValue::from_str(value.trim()).is_err()
                {
                    return Err(ValidationError::InvalidHeader(name.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Errors that occur during fetch request validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Method is not one of the supported HTTP methods.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("URL must not be empty")]
    EmptyUrl,

    #[error("URL too long: {0} bytes")]
    UrlTooLong(usize),

    /// URL could not be parsed as an absolute URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Only `http` and `https` upstreams are supported.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// A path-only URL needs a `source` to resolve against.
    #[error("Relative URL '{0}' requires a source")]
    RelativeUrlWithoutSource(String),

    /// The named source does not exist or is inactive.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The source exists but has been deactivated.
    #[error("Source is inactive: {0}")]
    InactiveSource(String),

    /// An absolute URL does not belong to the named source.
    #[error("URL does not belong to source '{0}'")]
    UrlOutsideSource(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_valid_requests() {
        assert!(FetchRequest::get("https://api.example.com/v1/items?page=1").validate().is_ok());

        let mut post = FetchRequest::get("http://localhost:8080/x");
        post.method = "post".to_string();
        post.body = Some(serde_json::json!({"q": 1}));
        assert!(post.validate().is_ok());

        let mut relative = FetchRequest::get("/v1/items");
        relative.source = Some("weather".to_string());
        assert!(relative.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_method() {
        let mut request = FetchRequest::get("https://api.example.com");
        request.method = "TRACE".to_string();
        assert_eq!(request.validate(), Err(ValidationError::MethodNotAllowed("TRACE".to_string())));
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert_eq!(FetchRequest::get("  ").validate(), Err(ValidationError::EmptyUrl));
        assert!(matches!(
            FetchRequest::get("not a url").validate(),
            Err(ValidationError::InvalidUrl(_))
        ));
        assert_eq!(
            FetchRequest::get("ftp://files.example.com/a").validate(),
            Err(ValidationError::UnsupportedScheme("ftp".to_string()))
        );
        assert!(matches!(
            FetchRequest::get("/v1/items").validate(),
            Err(ValidationError::RelativeUrlWithoutSource(_))
        ));
        let long = format!("https://api.example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(FetchRequest::get(long).validate(), Err(ValidationError::UrlTooLong(_))));
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut request = FetchRequest::get("https://api.example.com");
        request.headers =
            Some(BTreeMap::from([("bad header".to_string(), "value".to_string())]));
        assert_eq!(
            request.validate(),
            Err(ValidationError::InvalidHeader("bad header".to_string()))
        );
    }
}
