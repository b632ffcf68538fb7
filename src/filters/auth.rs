//! Authentication filter: derives the identity, verifies the token, and
//! transparently refreshes expired access tokens.
//!
//! Only an expired token may enter the refresh path. Any other verification
//! failure means something is wrong with the token itself and the request is
//! forbidden outright.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{access_forbidden, redirect_to_authorization, request_scope};
use crate::config::Settings;
use crate::cookies;
use crate::identity::Identity;
use crate::provider::{RefreshError, VerificationError};
use crate::proxy::ProxyState;
use crate::scope::RequestScope;

pub async fn authentication(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(scope) = request_scope(&req) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let user = match extract_identity(&state, &req) {
        Ok(user) => user,
        Err(err) => {
            error!(error = %err, "no session found in request, redirecting for authorization");
            return redirect_to_authorization(&state, &scope, &req);
        }
    };
    scope.set_identity(user.clone());

    if state.config.skip_token_verification {
        warn!("skip token verification enabled, skipping verification - TESTING ONLY");

        if user.is_expired() {
            error!(
                username = %user.username,
                sub = %user.id,
                expired_on = %user.expires_at,
                "the session has expired and verification switch off"
            );
            return redirect_to_authorization(&state, &scope, &req);
        }

        return next.run(req).await;
    }

    match state.verifier.verify(&user.raw_token).await {
        Ok(()) => next.run(req).await,
        Err(VerificationError::Expired) => refresh_session(state, scope, user, req, next).await,
        Err(err) => {
            error!(error = %err, "access token failed verification");
            access_forbidden(&scope)
        }
    }
}

/// The refresh leg of the authentication state machine: retrieve the refresh
/// token, exchange it at the provider, emit the new cookies, and swap the
/// scope's raw token before the chain continues.
async fn refresh_session(
    state: ProxyState,
    scope: Arc<RequestScope>,
    user: Identity,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.enable_refresh_tokens {
        error!(
            email = %user.email,
            sub = %user.id,
            expired_on = %user.expires_at,
            "session expired and access token refreshing is disabled"
        );
        return redirect_to_authorization(&state, &scope, &req);
    }

    info!(
        email = %user.email,
        sub = %user.id,
        "access token for user has expired, attempting to refresh the token"
    );

    let refresh_token = match retrieve_refresh_token(&state, req.headers(), &user).await {
        Ok(token) => token,
        Err(err) => {
            error!(
                error = %err,
                email = %user.email,
                sub = %user.id,
                "unable to find a refresh token for user"
            );
            return redirect_to_authorization(&state, &scope, &req);
        }
    };

    let tokens = match state.refresher.refresh(&refresh_token).await {
        Ok(tokens) => tokens,
        Err(RefreshError::Expired) => {
            warn!(
                email = %user.email,
                sub = %user.id,
                "refresh token has expired, cannot retrieve access token"
            );
            let mut response = redirect_to_authorization(&state, &scope, &req);
            cookies::clear_all_cookies(&state.config, response.headers_mut());
            return response;
        }
        Err(err) => {
            error!(
                error = %err,
                email = %user.email,
                sub = %user.id,
                "failed to refresh the access token"
            );
            return redirect_to_authorization(&state, &scope, &req);
        }
    };

    let access_expires_in = (tokens.access_expires_at - Utc::now())
        .to_std()
        .unwrap_or_default();

    // the provider may have rotated the refresh token
    let active_refresh = tokens
        .refresh_token
        .clone()
        .unwrap_or_else(|| refresh_token.clone());

    let mut refresh_expires_in = tokens.refresh_expires_in;
    if refresh_expires_in.is_zero() {
        // refresh expiry not reported: recover it from the token itself
        refresh_expires_in = get_access_cookie_expiration(&state.config, &active_refresh);
    }

    info!(
        cookie_name = %state.config.cookie_access_name,
        email = %user.email,
        sub = %user.id,
        expires_in = ?access_expires_in,
        refresh_expires_in = ?refresh_expires_in,
        "injecting the refreshed access token cookie"
    );

    let mut access_value = tokens.access_token.clone();
    if state.config.enable_encrypted_token || state.config.force_encrypted_cookie {
        access_value = match state.cipher.as_ref().map(|cipher| cipher.encrypt(&access_value)) {
            Some(Ok(value)) => value,
            _ => {
                error!(email = %user.email, sub = %user.id, "unable to encode the access token");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
    }

    let mut set_cookies = Vec::new();
    match cookies::access_token_cookie(&state.config, &access_value, access_expires_in) {
        Ok(cookie) => set_cookies.push(cookie),
        Err(err) => {
            error!(error = %err, "unable to inject the refreshed access token cookie");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    if let Some(new_refresh) = &tokens.refresh_token {
        let encrypted = match state.cipher.as_ref().map(|cipher| cipher.encrypt(new_refresh)) {
            Some(Ok(value)) => value,
            _ => {
                error!(email = %user.email, sub = %user.id, "failed to encrypt the refresh token");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if state.store.is_enabled() {
            // rotation must not inflate request latency: delete the row keyed
            // by the old access token and store the new one on a detached task
            let store = state.store.clone();
            let old_key = user.raw_token.clone();
            let new_key = tokens.access_token.clone();
            let ttl = refresh_expires_in;
            tokio::spawn(async move {
                if let Err(err) = store.delete_refresh_token(&old_key).await {
                    error!(error = %err, "failed to remove old refresh token");
                }
                if let Err(err) = store.store_refresh_token(&new_key, &encrypted, ttl).await {
                    error!(error = %err, "failed to store refresh token");
                }
            });
        } else {
            debug!(
                refresh_expires_in = ?refresh_expires_in,
                email = %user.email,
                sub = %user.id,
                "renew refresh cookie with new refresh token"
            );
            match cookies::refresh_token_cookie(&state.config, &encrypted, refresh_expires_in) {
                Ok(cookie) => set_cookies.push(cookie),
                Err(err) => {
                    error!(error = %err, "unable to inject the renewed refresh token cookie");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    }

    // downstream filters must observe the newly issued access token
    scope.update_raw_token(tokens.access_token.clone());

    let mut response = next.run(req).await;
    for cookie in set_cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Pulls the identity out of the request: the Authorization bearer header
/// wins, then the access cookie (decrypted when encrypted cookies are on).
/// Claims are parsed without verification; verification is a separate step.
fn extract_identity(state: &ProxyState, req: &Request) -> anyhow::Result<Identity> {
    let raw_token = match bearer_token(req.headers()) {
        Some(token) => token.to_string(),
        None => {
            let value = cookies::get_cookie(req.headers(), &state.config.cookie_access_name)
                .ok_or_else(|| anyhow::anyhow!("no bearer token or access cookie in request"))?;

            match state.cipher.as_ref() {
                Some(cipher)
                    if state.config.enable_encrypted_token
                        || state.config.force_encrypted_cookie =>
                {
                    cipher.decrypt(&value)?
                }
                _ => value,
            }
        }
    };

    let token = jsonwebtoken::dangerous::insecure_decode::<Value>(&raw_token)
        .map_err(|e| anyhow::anyhow!("unable to decode the access token: {}", e))?;

    Identity::from_claims(raw_token, &token.claims)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Looks the refresh token up in the session store (keyed by the access
/// token the client presented), falling back to the refresh cookie, and
/// decrypts it.
async fn retrieve_refresh_token(
    state: &ProxyState,
    headers: &HeaderMap,
    user: &Identity,
) -> anyhow::Result<String> {
    let encrypted = match state.store.get_refresh_token(&user.raw_token).await {
        Ok(value) => value,
        Err(_) => cookies::get_cookie(headers, &state.config.cookie_refresh_name)
            .ok_or_else(|| anyhow::anyhow!("no refresh token cookie in request"))?,
    };

    match state.cipher.as_ref() {
        Some(cipher) => cipher.decrypt(&encrypted),
        None => Ok(encrypted),
    }
}

/// Lifetime to give the refreshed cookie when the provider did not report
/// one: the refresh token's own `exp` claim when present and in the future,
/// the configured access-token duration otherwise.
pub fn get_access_cookie_expiration(config: &Settings, refresh_token: &str) -> Duration {
    let fallback = config.access_token_duration();

    let Ok(token) = jsonwebtoken::dangerous::insecure_decode::<Value>(refresh_token) else {
        debug!("unable to parse the refresh token, using the default access token duration");
        return fallback;
    };

    let Some(exp) = token.claims.get("exp").and_then(Value::as_i64) else {
        return fallback;
    };

    match Utc.timestamp_opt(exp, 0) {
        chrono::LocalResult::Single(at) if at > Utc::now() => {
            (at - Utc::now()).to_std().unwrap_or(fallback)
        }
        _ => fallback,
    }
}
