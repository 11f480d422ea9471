//! Cache entry types: request keys and stored response snapshots.
//!
//! A stored response is the unit written into a partition. Its body is an
//! immutable `Bytes` buffer, so cloning a response is the snapshot taken
//! before the same response is handed back to the caller.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

/// Normalized identity of a cache entry: upper-cased method plus URL
/// without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    /// Key for a GET of an absolute path on `origin`.
    pub fn for_path(origin: &Url, path: &str) -> Result<Self, url::ParseError> {
        Ok(Self::get(&origin.join(path)?))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Immutable snapshot of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A 200 response with a content type and body.
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(
            200,
            vec![("content-type".to_string(), content_type.to_string())],
            body,
        )
    }

    /// Whether the status is in the 2xx range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup (first value).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Take an immutable copy that can be persisted while the original is
    /// returned to the caller. Shares the body buffer.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        let url = Url::parse("https://example.org/case.html#section-2").unwrap();
        let key = RequestKey::new("get", &url);
        assert_eq!(key.method(), "GET");
        assert_eq!(key.url(), "https://example.org/case.html");
        assert_eq!(key, RequestKey::get(&Url::parse("https://example.org/case.html").unwrap()));
    }

    #[test]
    fn test_query_is_part_of_key() {
        let a = RequestKey::get(&Url::parse("https://example.org/api/cases?page=1").unwrap());
        let b = RequestKey::get(&Url::parse("https://example.org/api/cases?page=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_for_path_resolves_against_origin() {
        let origin = Url::parse("http://localhost:3000/").unwrap();
        let key = RequestKey::for_path(&origin, "/index.html").unwrap();
        assert_eq!(key.to_string(), "GET http://localhost:3000/index.html");
    }

    #[test]
    fn test_snapshot_shares_body() {
        let resp = StoredResponse::ok("text/css", "body { margin: 0 }");
        let snap = resp.snapshot();
        assert_eq!(snap.body.as_ptr(), resp.body.as_ptr());
        assert_eq!(snap.header("Content-Type"), Some("text/css"));
    }
}
