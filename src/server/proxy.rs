//! Proxy handler: every request outside the control namespace goes
//! through the router.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::warn;
use url::Url;

use crate::cache::entry::StoredResponse;
use crate::net::fetcher::is_hop_by_hop;
use crate::router::request::{InterceptedRequest, RequestMode};
use crate::router::Intercept;
use crate::server::control_api::AppState;

/// Request bodies above this size are refused.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Header naming the route that produced a response.
pub const ROUTE_HEADER: &str = "x-offline-tier-route";

/// Resolve the request target: absolute-form URIs are used as-is,
/// origin-form URIs are resolved against the application origin.
pub fn request_url(uri: &Uri, origin: &Url) -> Result<Url, url::ParseError> {
    if uri.scheme().is_some() {
        Url::parse(&uri.to_string())
    } else {
        let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
        origin.join(target)
    }
}

/// Build an intercepted request from HTTP request parts.
pub fn to_intercepted(
    method: &str,
    url: Url,
    headers: &axum::http::HeaderMap,
    body: Bytes,
) -> InterceptedRequest {
    let mut request = InterceptedRequest::new(method, url).with_body(body);
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request.headers.push((name.as_str().to_string(), value.to_string()));
        }
    }
    if let Some(mode) = request
        .header("sec-fetch-mode")
        .map(RequestMode::from_sec_fetch_mode)
    {
        request.mode = mode;
    }
    request
}

/// Convert a stored response into an HTTP response.
pub fn to_http(response: StoredResponse, route: Option<&'static str>) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(route) = route {
        builder = builder.header(ROUTE_HEADER, HeaderValue::from_static(route));
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

pub async fn handle(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let url = match request_url(&parts.uri, &state.origin) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let request = to_intercepted(parts.method.as_str(), url, &parts.headers, body);

    match state.router.intercept(request) {
        Intercept::Passthrough(request) => match state.fetcher.fetch(&request).await {
            Ok(response) => to_http(response, None),
            Err(e) => {
                warn!(request_id = %request.id, url = %request.url, error = %e, "Passthrough failed");
                (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
            }
        },
        Intercept::Respond { route, response } => match response.await {
            Ok(response) => to_http(response, Some(route.as_str())),
            Err(e) => {
                warn!(route = %route, error = %e, "No response available");
                (StatusCode::GATEWAY_TIMEOUT, e.to_string()).into_response()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form_resolves_against_origin() {
        let origin = Url::parse("http://127.0.0.1:3000/").unwrap();
        let uri: Uri = "/api/cases?page=2".parse().unwrap();
        assert_eq!(
            request_url(&uri, &origin).unwrap().as_str(),
            "http://127.0.0.1:3000/api/cases?page=2"
        );
    }

    #[test]
    fn test_absolute_form_is_kept() {
        let origin = Url::parse("http://127.0.0.1:3000/").unwrap();
        let uri: Uri = "https://fonts.gstatic.com/s/inter.woff2".parse().unwrap();
        assert_eq!(
            request_url(&uri, &origin).unwrap().host_str(),
            Some("fonts.gstatic.com")
        );
    }

    #[test]
    fn test_navigation_mode_from_header() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        let req = to_intercepted(
            "GET",
            Url::parse("http://a/case.html").unwrap(),
            &headers,
            Bytes::new(),
        );
        assert_eq!(req.mode, RequestMode::Navigate);
        assert!(req.wants_html());
    }

    #[test]
    fn test_to_http_drops_hop_by_hop_and_tags_route() {
        let stored = StoredResponse::new(
            200,
            vec![
                ("content-type".into(), "text/css".into()),
                ("transfer-encoding".into(), "chunked".into()),
            ],
            "a{}",
        );
        let resp = to_http(stored, Some("static_asset"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert_eq!(resp.headers().get(ROUTE_HEADER).unwrap(), "static_asset");
    }
}
