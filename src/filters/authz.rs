//! Authorization filter: obtains (and caches) the provider's decision for
//! the identity and the request URL.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tracing::{debug, error, info};

use super::{original_uri, redirect_to_authorization, request_scope, revoke_proxy};
use crate::provider::AuthzDecision;
use crate::proxy::ProxyState;
use crate::store::StoreError;

pub async fn authorization(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(scope) = request_scope(&req) else {
        return next.run(req).await;
    };

    // a decision has already been made upstream of us
    if scope.is_denied() {
        return next.run(req).await;
    }
    let Some(user) = scope.identity() else {
        return next.run(req).await;
    };

    let url = original_uri(&req);
    let url_key = url.to_string();

    let mut no_authz = false;
    let mut decision = AuthzDecision::Undecided;
    let mut authz_err = None;

    match state.store.get_authz(&user.raw_token, &url_key).await {
        Ok(cached) => decision = cached,
        Err(StoreError::NotFound) => no_authz = true,
        Err(err) => {
            // store troubles never fail the request, they cost us a provider
            // round-trip
            error!(error = %err, "problem reading authz decision from store");
            no_authz = true;
        }
    }

    if no_authz {
        let pat = state.pat.current();
        (decision, authz_err) = state
            .authz
            .authorize(
                user.permissions.as_ref(),
                &url,
                state.config.provider_timeout(),
                &pat,
                &state.config.realm,
            )
            .await;
    }

    if let Some(err) = authz_err {
        if err.is_informational() {
            info!("{err}");
        } else {
            error!(error = %err, "unexpected error during authorization");
            return revoke_proxy(&scope);
        }
    }

    if no_authz {
        let ttl = (user.expires_at - Utc::now()).to_std().unwrap_or_default();
        if let Err(err) = state
            .store
            .store_authz(&user.raw_token, &url_key, decision, ttl)
            .await
        {
            error!(error = %err, "problem setting authz decision to store");
        }
    }

    if decision == AuthzDecision::Denied {
        if !no_authz {
            debug!(user = %user.username, path = %url.path(), "authz denied from cache");
        }
        return redirect_to_authorization(&state, &scope, &req);
    }

    next.run(req).await
}
