//! The request descriptor handed to the router by the host.

use bytes::Bytes;
use url::Url;
use uuid::Uuid;

use crate::cache::entry::RequestKey;

/// How the request was initiated (mirrors the Fetch `mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

impl RequestMode {
    /// Parse a `Sec-Fetch-Mode` header value. Unknown values map to `NoCors`.
    pub fn from_sec_fetch_mode(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => RequestMode::Navigate,
            "same-origin" => RequestMode::SameOrigin,
            "cors" => RequestMode::Cors,
            _ => RequestMode::NoCors,
        }
    }
}

/// An intercepted request: method, parsed URL, headers, navigation mode.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub id: Uuid,
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub mode: RequestMode,
    pub body: Bytes,
}

impl InterceptedRequest {
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.to_ascii_uppercase(),
            url,
            headers: Vec::new(),
            mode: RequestMode::default(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    /// A top-level navigation to `url`.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .with_mode(RequestMode::Navigate)
            .with_header("accept", "text/html,application/xhtml+xml")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup (first value).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// Navigation mode, or an `Accept` header that admits HTML.
    pub fn wants_html(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self.header("accept").is_some_and(|a| a.contains("text/html"))
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}
