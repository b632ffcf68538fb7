//! Terminal handler: forwards the filtered request to the upstream origin.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::filters::original_uri;
use crate::proxy::ProxyState;

pub async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    // nested routers strip their prefix; the upstream wants the full path
    let uri = original_uri(&req);
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = format!(
        "{}{}",
        state.config.upstream_url.trim_end_matches('/'),
        path_and_query
    );

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to read the request body");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut headers = parts.headers;
    // the client carries its Host for us; reqwest sets the upstream's
    headers.remove(header::HOST);

    let result = state
        .http
        .request(parts.method, &target)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let headers = upstream_response.headers().clone();
            match upstream_response.bytes().await {
                Ok(bytes) => {
                    let mut response = Response::new(Body::from(bytes));
                    *response.status_mut() = status;
                    *response.headers_mut() = headers;
                    response
                }
                Err(err) => {
                    error!(error = %err, "failed to read the upstream response");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        Err(err) => {
            error!(error = %err, target, "failed to reach the upstream");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
