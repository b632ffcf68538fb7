//! Keycloak-flavoured OIDC provider client.
//!
//! Implements the provider seams against a real provider: token verification
//! against the provider's JWKS (fetched once and cached), the refresh-token
//! grant, the client-credentials grant for the provider access token, and a
//! UMA-style authorization check against the provider's protection API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Uri;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::provider::{
    AuthorizationProvider, AuthzDecision, AuthzError, ProviderAccessToken, RefreshError,
    RefreshedTokens, TokenRefresher, TokenVerifier, VerificationError,
};

/// A JSON Web Key Set, as served by the provider's JWKS endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// List of keys.
    pub keys: Vec<Jwk>,
}

/// A JSON Web Key.
#[derive(Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    pub kid: String,
    /// Modulus (Base64URL encoded).
    pub n: String,
    /// Exponent (Base64URL encoded).
    pub e: String,
    /// Algorithm (e.g., "RS256").
    pub alg: String,
    /// Key use (e.g., "sig").
    pub r#use: String,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_expires_in: u64,
}

#[derive(Deserialize)]
struct ResourceRepresentation {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    resource_scopes: Vec<ResourceScope>,
}

#[derive(Deserialize)]
struct ResourceScope {
    #[serde(default)]
    name: Option<String>,
}

pub struct OidcClient {
    http: reqwest::Client,
    jwks_url: String,
    token_url: String,
    resource_set_url: String,
    issuer: String,
    client_id: String,
    client_secret: String,
    skip_client_id_check: bool,
    skip_issuer_check: bool,
    jwks_cache: Cache<String, Jwks>,
}

impl OidcClient {
    pub fn new(config: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_url: config.jwks_url.clone(),
            token_url: config.token_url.clone(),
            resource_set_url: format!(
                "{}/authz/protection/resource_set",
                config.issuer.trim_end_matches('/')
            ),
            issuer: config.issuer.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            skip_client_id_check: config.skip_access_token_client_id_check,
            skip_issuer_check: config.skip_access_token_issuer_check,
            jwks_cache: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .build(),
        }
    }

    /// Resolves the decoding key for a token, fetching the JWKS once and
    /// caching it.
    async fn decoding_key(&self, kid: &str) -> anyhow::Result<DecodingKey> {
        let jwks = self
            .jwks_cache
            .try_get_with(self.jwks_url.clone(), async {
                let jwks: Jwks = self
                    .http
                    .get(&self.jwks_url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok::<_, anyhow::Error>(jwks)
            })
            .await
            .map_err(|e| anyhow::anyhow!("failed to fetch or cache JWKS: {}", e))?;

        let jwk = jwks
            .keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| anyhow::anyhow!("JWK not found"))?;

        Ok(DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?)
    }

    /// Obtains a fresh provider access token via the client-credentials
    /// grant.
    pub async fn client_credentials_grant(&self) -> anyhow::Result<String> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];

        let token: TokenEndpointResponse = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenVerifier for OidcClient {
    async fn verify(&self, raw_token: &str) -> Result<(), VerificationError> {
        let header =
            decode_header(raw_token).map_err(|e| VerificationError::Other(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| VerificationError::Other("token header has no kid".to_string()))?;

        let decoding_key = self
            .decoding_key(&kid)
            .await
            .map_err(|e| VerificationError::Other(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        if self.skip_client_id_check {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&[self.client_id.as_str()]);
        }
        if !self.skip_issuer_check {
            validation.set_issuer(&[self.issuer.as_str()]);
        }

        match decode::<Value>(raw_token, &decoding_key, &validation) {
            Ok(_) => Ok(()),
            Err(err) => Err(match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerificationError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => VerificationError::BadSignature,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => VerificationError::BadAudience,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => VerificationError::BadIssuer,
                _ => VerificationError::Other(err.to_string()),
            }),
        }
    }
}

#[async_trait]
impl TokenRefresher for OidcClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError::Provider(e.to_string()))?;

        if response.status().is_client_error() {
            // Keycloak answers invalid_grant when the refresh token is no
            // longer active.
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") {
                return Err(RefreshError::Expired);
            }
            return Err(RefreshError::Provider(body));
        }

        let token: TokenEndpointResponse = response
            .error_for_status()
            .map_err(|e| RefreshError::Provider(e.to_string()))?
            .json()
            .await
            .map_err(|e| RefreshError::Provider(e.to_string()))?;

        Ok(RefreshedTokens {
            access_expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in as i64),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            refresh_expires_in: Duration::from_secs(token.refresh_expires_in),
        })
    }
}

#[async_trait]
impl AuthorizationProvider for OidcClient {
    async fn authorize(
        &self,
        permissions: Option<&Value>,
        url: &Uri,
        timeout: Duration,
        pat: &str,
        realm: &str,
    ) -> (AuthzDecision, Option<AuthzError>) {
        debug!(path = %url.path(), realm, "querying provider resources for path");

        let response = match self
            .http
            .get(&self.resource_set_url)
            .query(&[("uri", url.path()), ("matchingUri", "true"), ("deep", "true")])
            .bearer_auth(pat)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return (AuthzDecision::Denied, Some(AuthzError::ResourceRetrieve)),
        };

        let resources: Vec<ResourceRepresentation> = match response.error_for_status() {
            Ok(response) => match response.json().await {
                Ok(resources) => resources,
                Err(_) => return (AuthzDecision::Denied, Some(AuthzError::ResourceRetrieve)),
            },
            Err(_) => return (AuthzDecision::Denied, Some(AuthzError::ResourceRetrieve)),
        };

        // no provider resource covers this path: the provider considers it
        // unprotected
        let Some(resource) = resources.first() else {
            return (AuthzDecision::Allowed, Some(AuthzError::NoIdpResourceForPath));
        };
        let Some(resource_id) = resource.id.as_deref() else {
            return (AuthzDecision::Denied, Some(AuthzError::ResourceIdNotPresent));
        };

        let Some(granted) = permissions
            .and_then(|p| p.get("permissions"))
            .and_then(Value::as_array)
        else {
            return (AuthzDecision::Denied, Some(AuthzError::PermissionNotInToken));
        };
        let Some(granted) = granted
            .iter()
            .find(|p| p.get("rsid").and_then(Value::as_str) == Some(resource_id))
        else {
            return (AuthzDecision::Denied, Some(AuthzError::PermissionNotInToken));
        };

        let required: Vec<&str> = resource
            .resource_scopes
            .iter()
            .filter_map(|scope| scope.name.as_deref())
            .collect();

        if !required.is_empty() {
            let held: Vec<&str> = granted
                .get("scopes")
                .and_then(Value::as_array)
                .map(|scopes| scopes.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            if !required.iter().all(|scope| held.contains(scope)) {
                return (
                    AuthzDecision::Denied,
                    Some(AuthzError::TokenScopeNotMatchResourceScope),
                );
            }
        }

        (AuthzDecision::Allowed, None)
    }
}

/// Rotates the provider access token on an interval, for as long as the
/// process lives. Failures leave the previous token in place.
pub fn spawn_pat_refresh(
    client: Arc<OidcClient>,
    pat: Arc<ProviderAccessToken>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match client.client_credentials_grant().await {
                Ok(token) => pat.rotate(token),
                Err(err) => {
                    warn!(error = %err, "failed to refresh the provider access token");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::traits::PublicKeyParts;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestProvider {
        server: MockServer,
        encoding_key: EncodingKey,
        client: OidcClient,
    }

    async fn test_provider() -> TestProvider {
        let server = MockServer::start().await;

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate a key");
        let public_key = RsaPublicKey::from(&private_key);

        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: "test-kid".to_string(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            alg: "RS256".to_string(),
            r#use: "sig".to_string(),
        };

        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Jwks { keys: vec![jwk] }))
            .mount(&server)
            .await;

        let settings = Settings {
            issuer: server.uri(),
            jwks_url: format!("{}/jwks.json", server.uri()),
            token_url: format!("{}/token", server.uri()),
            client_id: "revenant".to_string(),
            client_secret: "secret".to_string(),
            ..Settings::default()
        };

        let encoding_key =
            EncodingKey::from_rsa_der(private_key.to_pkcs1_der().unwrap().as_bytes());
        let client = OidcClient::new(&settings);

        TestProvider {
            server,
            encoding_key,
            client,
        }
    }

    fn mint(provider: &TestProvider, claims: Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-kid".to_string());
        encode(&header, &claims, &provider.encoding_key).unwrap()
    }

    #[tokio::test]
    async fn test_verify_success() {
        let provider = test_provider().await;
        let token = mint(
            &provider,
            json!({
                "sub": "user",
                "aud": "revenant",
                "iss": provider.server.uri(),
                "exp": 10000000000i64,
            }),
        );

        assert!(provider.client.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_expired() {
        let provider = test_provider().await;
        let token = mint(
            &provider,
            json!({
                "sub": "user",
                "aud": "revenant",
                "iss": provider.server.uri(),
                "exp": 1,
            }),
        );

        assert!(matches!(
            provider.client.verify(&token).await,
            Err(VerificationError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_verify_bad_signature() {
        let provider = test_provider().await;

        // a token signed by a different key, presented under the same kid
        let mut rng = rand::thread_rng();
        let other_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-kid".to_string());
        let token = encode(
            &header,
            &json!({
                "sub": "user",
                "aud": "revenant",
                "iss": provider.server.uri(),
                "exp": 10000000000i64,
            }),
            &EncodingKey::from_rsa_der(other_key.to_pkcs1_der().unwrap().as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            provider.client.verify(&token).await,
            Err(VerificationError::BadSignature)
        ));
    }

    #[tokio::test]
    async fn test_verify_bad_audience() {
        let provider = test_provider().await;
        let token = mint(
            &provider,
            json!({
                "sub": "user",
                "aud": "somebody-else",
                "iss": provider.server.uri(),
                "exp": 10000000000i64,
            }),
        );

        assert!(matches!(
            provider.client.verify(&token).await,
            Err(VerificationError::BadAudience)
        ));
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let provider = test_provider().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "refresh_expires_in": 28800,
            })))
            .mount(&provider.server)
            .await;

        let tokens = provider.client.refresh("old-refresh").await.unwrap();

        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(tokens.refresh_expires_in, Duration::from_secs(28800));
        assert!(tokens.access_expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_refresh_expired_refresh_token() {
        let provider = test_provider().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Token is not active",
            })))
            .mount(&provider.server)
            .await;

        assert!(matches!(
            provider.client.refresh("stale").await,
            Err(RefreshError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let provider = test_provider().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "pat-token",
                "expires_in": 60,
            })))
            .mount(&provider.server)
            .await;

        assert_eq!(
            provider.client.client_credentials_grant().await.unwrap(),
            "pat-token"
        );
    }

    #[tokio::test]
    async fn test_authorize_allowed_with_matching_permission() {
        let provider = test_provider().await;

        Mock::given(method("GET"))
            .and(path("/authz/protection/resource_set"))
            .and(query_param("uri", "/api/v1/x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"_id": "res-1", "resource_scopes": [{"name": "view"}]}
            ])))
            .mount(&provider.server)
            .await;

        let permissions = json!({"permissions": [{"rsid": "res-1", "scopes": ["view"]}]});
        let (decision, err) = provider
            .client
            .authorize(
                Some(&permissions),
                &"/api/v1/x".parse().unwrap(),
                Duration::from_secs(5),
                "pat",
                "test",
            )
            .await;

        assert_eq!(decision, AuthzDecision::Allowed);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_authorize_unprotected_path() {
        let provider = test_provider().await;

        Mock::given(method("GET"))
            .and(path("/authz/protection/resource_set"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&provider.server)
            .await;

        let (decision, err) = provider
            .client
            .authorize(
                None,
                &"/public".parse().unwrap(),
                Duration::from_secs(5),
                "pat",
                "test",
            )
            .await;

        assert_eq!(decision, AuthzDecision::Allowed);
        assert!(matches!(err, Some(AuthzError::NoIdpResourceForPath)));
    }

    #[tokio::test]
    async fn test_authorize_permission_not_in_token() {
        let provider = test_provider().await;

        Mock::given(method("GET"))
            .and(path("/authz/protection/resource_set"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"_id": "res-1", "resource_scopes": []}
            ])))
            .mount(&provider.server)
            .await;

        let (decision, err) = provider
            .client
            .authorize(
                None,
                &"/api".parse().unwrap(),
                Duration::from_secs(5),
                "pat",
                "test",
            )
            .await;

        assert_eq!(decision, AuthzDecision::Denied);
        assert!(matches!(err, Some(AuthzError::PermissionNotInToken)));
    }

    #[tokio::test]
    async fn test_authorize_scope_mismatch() {
        let provider = test_provider().await;

        Mock::given(method("GET"))
            .and(path("/authz/protection/resource_set"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"_id": "res-1", "resource_scopes": [{"name": "write"}]}
            ])))
            .mount(&provider.server)
            .await;

        let permissions = json!({"permissions": [{"rsid": "res-1", "scopes": ["view"]}]});
        let (decision, err) = provider
            .client
            .authorize(
                Some(&permissions),
                &"/api".parse().unwrap(),
                Duration::from_secs(5),
                "pat",
                "test",
            )
            .await;

        assert_eq!(decision, AuthzDecision::Denied);
        assert!(matches!(
            err,
            Some(AuthzError::TokenScopeNotMatchResourceScope)
        ));
    }

    #[tokio::test]
    async fn test_authorize_unreachable_provider() {
        let settings = Settings {
            issuer: "http://127.0.0.1:1".to_string(),
            ..Settings::default()
        };
        let client = OidcClient::new(&settings);

        let (decision, err) = client
            .authorize(
                None,
                &"/api".parse().unwrap(),
                Duration::from_millis(100),
                "pat",
                "test",
            )
            .await;

        assert_eq!(decision, AuthzDecision::Denied);
        assert!(matches!(err, Some(AuthzError::ResourceRetrieve)));
    }
}
