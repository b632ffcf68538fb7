//! Deny utilities.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::request_scope;
use crate::scope::RequestScope;

/// Terminal handler that denies unconditionally.
pub async fn deny() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

/// Marks the scope denied and continues, letting downstream filters
/// short-circuit gracefully. Creates a scope if none is attached yet.
pub async fn proxy_deny(mut req: Request, next: Next) -> Response {
    match request_scope(&req) {
        Some(scope) => scope.deny(),
        None => {
            let scope = Arc::new(RequestScope::new(req.uri().path()));
            scope.deny();
            req.extensions_mut().insert(scope);
        }
    }

    next.run(req).await
}
