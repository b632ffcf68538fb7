//! Seams toward the OpenID Connect provider.
//!
//! The filter chain consumes the provider through three narrow traits:
//! verification, refresh, and fine-grained authorization. The concrete
//! client lives in [`crate::oidc`]; tests substitute fakes.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Uri;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Why a token failed verification. The split between [`Expired`] and
/// everything else is load-bearing: only expiry may trigger a refresh, an
/// invalid signature or wrong issuer must never be silently refreshed.
///
/// [`Expired`]: VerificationError::Expired
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("token is expired")]
    Expired,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token audience does not match")]
    BadAudience,
    #[error("token issuer does not match")]
    BadIssuer,
    #[error("token verification failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies the signature and the registered claims of a raw token,
    /// honoring the configured client-id and issuer checks.
    async fn verify(&self, raw_token: &str) -> Result<(), VerificationError>;
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh token has expired")]
    Expired,
    #[error("token endpoint request failed: {0}")]
    Provider(String),
}

/// Outcome of a refresh-token grant.
#[derive(Clone, Debug)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub access_expires_at: DateTime<Utc>,
    /// Zero when the provider did not report a refresh-token lifetime.
    pub refresh_expires_in: Duration,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError>;
}

/// Verdict from the provider's authorization service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthzDecision {
    Allowed,
    Denied,
    Undecided,
}

/// Errors from the authorization service. All variants except
/// [`Backend`](AuthzError::Backend) are classifications that accompany a
/// decision; they are logged and the decision stands.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("permission not in token")]
    PermissionNotInToken,
    #[error("unable to retrieve resources from the provider")]
    ResourceRetrieve,
    #[error("no provider resource matches the request path")]
    NoIdpResourceForPath,
    #[error("provider resource has no id")]
    ResourceIdNotPresent,
    #[error("token scopes do not match resource scopes")]
    TokenScopeNotMatchResourceScope,
    #[error("authorization backend failure: {0}")]
    Backend(String),
}

impl AuthzError {
    pub fn is_informational(&self) -> bool {
        !matches!(self, AuthzError::Backend(_))
    }
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Obtains a decision for (identity, URL). `permissions` is the token's
    /// opaque `authorization` claim, `pat` the provider access token.
    async fn authorize(
        &self,
        permissions: Option<&Value>,
        url: &Uri,
        timeout: Duration,
        pat: &str,
        realm: &str,
    ) -> (AuthzDecision, Option<AuthzError>);
}

/// Process-wide credential the proxy presents to the provider's
/// authorization APIs. Rotated out-of-band; readers copy the current value
/// under the lock and never hold a reference into the cell.
pub struct ProviderAccessToken {
    current: Mutex<String>,
}

impl ProviderAccessToken {
    pub fn new(initial: String) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    pub fn rotate(&self, token: String) {
        *self.current.lock().unwrap() = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_access_token_rotation() {
        let pat = ProviderAccessToken::new("first".to_string());
        assert_eq!(pat.current(), "first");

        pat.rotate("second".to_string());
        assert_eq!(pat.current(), "second");
    }

    #[test]
    fn test_classification_errors_are_informational() {
        assert!(AuthzError::PermissionNotInToken.is_informational());
        assert!(AuthzError::ResourceRetrieve.is_informational());
        assert!(AuthzError::NoIdpResourceForPath.is_informational());
        assert!(AuthzError::ResourceIdNotPresent.is_informational());
        assert!(AuthzError::TokenScopeNotMatchResourceScope.is_informational());
        assert!(!AuthzError::Backend("boom".to_string()).is_informational());
    }

    #[test]
    fn test_expired_error_text() {
        // Downstream log lines and older deployments grep for this literal.
        assert_eq!(VerificationError::Expired.to_string(), "token is expired");
    }
}
