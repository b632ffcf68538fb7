//! Ensures every request carries a correlation id.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::proxy::ProxyState;

/// Sets a freshly generated time-ordered id when the configured header is
/// absent.
pub async fn request_id(State(state): State<ProxyState>, mut req: Request, next: Next) -> Response {
    if !req.headers().contains_key(&state.request_id_header)
        && let Ok(value) = HeaderValue::from_str(&Uuid::now_v7().to_string())
    {
        req.headers_mut()
            .insert(state.request_id_header.clone(), value);
    }

    next.run(req).await
}
