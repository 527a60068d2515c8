//! Deterministic fingerprints for logical requests.
//!
//! A key is the hex SHA-256 of four newline-separated components:
//!
//! ```text
//! METHOD
//! canonical url (scheme/host lowercased, fragment dropped, query pairs sorted)
//! body digest (hex SHA-256 of the body text, or "-")
//! allow-listed headers ("name=value" pairs sorted by name, joined with '&')
//! ```
//!
//! Headers outside the allow-list never influence the key, so per-caller noise such as
//! tracing ids or user agents does not fragment the cache.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::{form_urlencoded, Url};

/// Derives cache keys from request components.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyResolver {
    header_allowlist: Vec<String>,
}

impl CacheKeyResolver {
    /// Creates a resolver that folds the named headers (case-insensitive) into keys.
    #[must_use]
    pub fn new<I, S>(header_allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut header_allowlist: Vec<String> = header_allowlist
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        header_allowlist.sort();
        header_allowlist.dedup();
        Self { header_allowlist }
    }

    #[must_use]
    pub fn header_allowlist(&self) -> &[String] {
        &self.header_allowlist
    }

    /// Computes the key for a logical request.
    #[must_use]
    pub fn resolve(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        headers: Option<&BTreeMap<String, String>>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.trim().to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonicalize_url(url).as_bytes());
        hasher.update(b"\n");
        hasher.update(body_digest(body).as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_headers(headers).as_bytes());
        hex::encode(hasher.finalize())
    }

    fn canonical_headers(&self, headers: Option<&BTreeMap<String, String>>) -> String {
        let Some(headers) = headers else {
            return String::new();
        };
        if self.header_allowlist.is_empty() {
            return String::new();
        }

        let mut selected: Vec<(String, &str)> = headers
            .iter()
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim()))
            .filter(|(name, _)| self.header_allowlist.binary_search(name).is_ok())
            .collect();
        selected.sort();

        selected.iter().map(|(name, value)| format!("{name}={value}")).collect::<Vec<_>>().join("&")
    }
}

fn body_digest(body: Option<&str>) -> String {
    match body {
        Some(body) if !body.is_empty() => hex::encode(Sha256::digest(body.as_bytes())),
        _ => "-".to_string(),
    }
}

/// Normalizes a URL so that equivalent spellings produce the same string.
///
/// Unparseable input is returned trimmed but otherwise untouched, which still yields a
/// deterministic key.
#[must_use]
pub fn canonicalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> =
        url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let query = form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish();
        url.set_query(Some(&query));
    }

    url.to_string()
}
