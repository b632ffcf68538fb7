//! Host allow-list, HTTPS redirect, browser security headers, and the HTTP
//! method check.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::{access_forbidden, request_scope};
use crate::proxy::ProxyState;

const ALLOWED_METHODS: [Method; 8] = [
    Method::DELETE,
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::POST,
    Method::PUT,
    Method::TRACE,
];

pub async fn security(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let config = &state.config;

    if !config.hostnames.is_empty() {
        let host = request_host(&req);
        let allowed = host
            .as_deref()
            .is_some_and(|host| config.hostnames.iter().any(|allowed| allowed == host));

        if !allowed {
            warn!(host = host.as_deref().unwrap_or(""), "failed security filter, host is not allowed");
            return match request_scope(&req) {
                Some(scope) => access_forbidden(&scope),
                None => StatusCode::FORBIDDEN.into_response(),
            };
        }
    }

    if config.enable_https_redirect
        && is_plaintext(&req)
        && let Some(authority) = request_authority(&req)
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{authority}{path_and_query}");
        return (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response();
    }

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    if config.enable_content_no_sniff {
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
    }
    if config.enable_frame_deny {
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    }
    if config.enable_browser_xss_filter {
        headers.insert(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        );
    }
    if let Some(csp) = &config.content_security_policy
        && let Ok(value) = HeaderValue::from_str(csp)
    {
        headers.insert(header::CONTENT_SECURITY_POLICY, value);
    }

    response
}

/// Rejects methods outside the allow-list with 501 Not Implemented.
pub async fn method_check(req: Request, next: Next) -> Response {
    if !ALLOWED_METHODS.contains(req.method()) {
        warn!(method = %req.method(), "method not implemented");
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }

    next.run(req).await
}

fn request_host(req: &Request) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    {
        return Some(host.split(':').next().unwrap_or(host).to_string());
    }
    req.uri().host().map(str::to_string)
}

fn request_authority(req: &Request) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    {
        return Some(host.to_string());
    }
    req.uri().authority().map(|a| a.as_str().to_string())
}

/// The request is plaintext unless the TLS terminator in front of us says
/// otherwise.
fn is_plaintext(req: &Request) -> bool {
    if let Some(proto) = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        return !proto.eq_ignore_ascii_case("https");
    }
    req.uri().scheme_str() != Some("https")
}
