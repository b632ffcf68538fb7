//! Entry filter: first in the chain.
//!
//! Creates the per-request scope (capturing the path exactly as it arrived),
//! normalizes the URL before any resource matching can happen, and records
//! the request metrics once the chain returns.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::request_scope;
use crate::proxy::ProxyState;
use crate::scope::{RequestScope, normalize_path};

pub async fn entrypoint(State(state): State<ProxyState>, mut req: Request, next: Next) -> Response {
    // Save the exact formatting of the incoming request before normalization
    let scope = Arc::new(RequestScope::new(req.uri().path()));
    req.extensions_mut().insert(scope);

    let normalized = normalize_path(req.uri().path());
    if normalized != req.uri().path() {
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{normalized}?{query}"),
            None => normalized,
        };
        let mut parts = req.uri().clone().into_parts();
        if let Ok(path_and_query) = path_and_query.parse() {
            parts.path_and_query = Some(path_and_query);
            if let Ok(uri) = Uri::from_parts(parts) {
                *req.uri_mut() = uri;
            }
        }
    }

    let method = req.method().clone();
    let start = Instant::now();

    // everything, including forwarding upstream, happens in this chain
    let response = next.run(req).await;

    state
        .metrics
        .observe(start.elapsed(), response.status(), &method);

    response
}

/// Logs each completed request, including the original escaped path when it
/// differs from the normalized one.
pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let raw_path = request_scope(&req).map(|scope| scope.raw_path().to_string());

    let response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    match raw_path {
        Some(raw) if raw != path => {
            info!(?latency, status, method = %method, path = %path, raw_path = %raw, "client request");
        }
        _ => {
            info!(?latency, status, method = %method, path = %path, "client request");
        }
    }

    response
}
