//! The ordered filter chain.
//!
//! Every request traverses: entry (scope + URL normalization + metrics) →
//! request-id → access log → security → method check, then per protected
//! resource: authentication → authorization → admission → identity headers,
//! and finally the upstream forwarder. A filter either delegates to the next
//! one or terminates the request with a redirect or an error status.

pub mod admission;
pub mod auth;
pub mod authz;
pub mod deny;
pub mod entry;
pub mod headers;
pub mod request_id;
pub mod security;

use std::sync::Arc;

use axum::extract::{OriginalUri, Request};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use url::form_urlencoded;

use crate::proxy::ProxyState;
use crate::scope::RequestScope;

/// The scope the entry filter attached to this request.
pub(crate) fn request_scope(req: &Request) -> Option<Arc<RequestScope>> {
    req.extensions().get::<Arc<RequestScope>>().cloned()
}

/// The request URI before nested routers stripped their prefix. This is the
/// normalized URI: the entry filter rewrites the URL before routing.
pub(crate) fn original_uri(req: &Request) -> Uri {
    req.extensions()
        .get::<OriginalUri>()
        .map(|original| original.0.clone())
        .unwrap_or_else(|| req.uri().clone())
}

/// Sends the client to the provider's login flow, or answers 401 when
/// redirects are disabled. Marks the scope denied either way.
pub(crate) fn redirect_to_authorization(
    state: &ProxyState,
    scope: &RequestScope,
    req: &Request,
) -> Response {
    scope.deny();

    if state.config.no_redirects {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let uri = original_uri(req);
    let encoded: String = form_urlencoded::byte_serialize(uri.to_string().as_bytes()).collect();
    let location = format!("{}?state={}", state.config.login_redirect_path, encoded);

    (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response()
}

pub(crate) fn access_forbidden(scope: &RequestScope) -> Response {
    scope.deny();
    StatusCode::FORBIDDEN.into_response()
}

/// Terminal handler for unexpected authorization-backend failures.
pub(crate) fn revoke_proxy(scope: &RequestScope) -> Response {
    scope.deny();
    StatusCode::UNAUTHORIZED.into_response()
}
