//! Configuration management for Revenant.
//!
//! Handles loading settings from `config.yaml` with `REVENANT_` environment
//! overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application configuration settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the proxy listens on (e.g. "127.0.0.1:3000").
    pub listen: String,
    /// Base URL of the upstream origin protected by the proxy.
    pub upstream_url: String,
    /// The provider's issuer URL (realm base). Used for issuer validation
    /// and to reach the provider's resource registration API.
    pub issuer: String,
    /// URL of the provider's JWKS endpoint.
    pub jwks_url: String,
    /// URL of the provider's token endpoint.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Provider-side tenant boundary.
    pub realm: String,
    /// Path unauthenticated clients are redirected to for login.
    pub login_redirect_path: String,
    /// Respond 401 instead of redirecting unauthenticated clients.
    pub no_redirects: bool,
    /// Skip token verification entirely. TESTING ONLY.
    pub skip_token_verification: bool,
    pub skip_access_token_client_id_check: bool,
    pub skip_access_token_issuer_check: bool,
    /// Exchange expired access tokens for new ones using the refresh token.
    pub enable_refresh_tokens: bool,
    /// Store the access token encrypted in its cookie.
    pub enable_encrypted_token: bool,
    pub force_encrypted_cookie: bool,
    /// 32-byte key for cookie encryption. Required when refresh tokens or
    /// encrypted cookies are enabled.
    pub encryption_key: Option<String>,
    pub cookie_access_name: String,
    pub cookie_refresh_name: String,
    pub cookie_domain: Option<String>,
    pub secure_cookie: bool,
    pub http_only_cookie: bool,
    pub same_site_cookie: String,
    /// Send the access token to the upstream as `X-Auth-Token`.
    pub enable_token_header: bool,
    /// Send the access token to the upstream as `Authorization: Bearer`.
    pub enable_authorization_header: bool,
    /// Forward the token cookies to the upstream.
    pub enable_authorization_cookies: bool,
    /// Custom claims to forward as headers, each entry `claim` or
    /// `claim|Header-Name`.
    pub add_claims: Vec<String>,
    /// Claim name to regular expression the claim must match.
    pub match_claims: HashMap<String, String>,
    /// Headers added to every response.
    pub response_headers: HashMap<String, String>,
    /// Host allow-list; empty allows any host.
    pub hostnames: Vec<String>,
    pub enable_https_redirect: bool,
    pub enable_browser_xss_filter: bool,
    pub enable_content_no_sniff: bool,
    pub enable_frame_deny: bool,
    pub content_security_policy: Option<String>,
    pub enable_request_id: bool,
    pub request_id_header: String,
    /// Deny requests that match no configured resource.
    pub enable_default_deny: bool,
    /// Cache authorization decisions and rotated refresh tokens in the
    /// session store instead of cookies.
    pub enable_session_store: bool,
    pub openid_provider_timeout_secs: u64,
    /// Fallback access-token lifetime when the provider reports none.
    pub access_token_duration_secs: u64,
    pub pat_refresh_interval_secs: u64,
    /// Protected URL prefixes and their admission rules.
    pub resources: Vec<Resource>,
    pub telemetry: TelemetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            upstream_url: "http://127.0.0.1:8080".to_string(),
            issuer: String::new(),
            jwks_url: String::new(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            realm: String::new(),
            login_redirect_path: "/oauth/authorize".to_string(),
            no_redirects: false,
            skip_token_verification: false,
            skip_access_token_client_id_check: false,
            skip_access_token_issuer_check: false,
            enable_refresh_tokens: false,
            enable_encrypted_token: false,
            force_encrypted_cookie: false,
            encryption_key: None,
            cookie_access_name: "kc-access".to_string(),
            cookie_refresh_name: "kc-state".to_string(),
            cookie_domain: None,
            secure_cookie: false,
            http_only_cookie: true,
            same_site_cookie: "Lax".to_string(),
            enable_token_header: true,
            enable_authorization_header: true,
            enable_authorization_cookies: true,
            add_claims: Vec::new(),
            match_claims: HashMap::new(),
            response_headers: HashMap::new(),
            hostnames: Vec::new(),
            enable_https_redirect: false,
            enable_browser_xss_filter: false,
            enable_content_no_sniff: true,
            enable_frame_deny: true,
            content_security_policy: None,
            enable_request_id: false,
            request_id_header: "X-Request-ID".to_string(),
            enable_default_deny: false,
            enable_session_store: false,
            openid_provider_timeout_secs: 30,
            access_token_duration_secs: 720 * 3600,
            pat_refresh_interval_secs: 300,
            resources: Vec::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Settings {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.openid_provider_timeout_secs)
    }

    pub fn access_token_duration(&self) -> Duration {
        Duration::from_secs(self.access_token_duration_secs)
    }
}

/// A protected URL prefix and the rules an identity must satisfy to reach
/// it. Immutable after configuration load.
#[derive(Clone, Debug, Deserialize)]
pub struct Resource {
    /// URL prefix, e.g. "/admin". A trailing wildcard is accepted and
    /// ignored since matching is prefix-based.
    pub url: String,
    /// Roles the identity must hold. All of them by default.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Accept any single role from `roles` instead of all of them.
    #[serde(default)]
    pub require_any_role: bool,
    /// Groups the identity must belong to; any single one suffices.
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// JSON format - structured logging suitable for log aggregation systems
    ///
    /// Produces compact, machine-readable JSON output ideal for production
    /// environments and log processing pipelines like ELK stack, Fluentd, etc.
    ///
    /// Default.
    #[default]
    Json,
    /// Pretty format - human-readable output for development
    ///
    /// Produces colorized, indented output that's easier to read during
    /// development and debugging. Not recommended for production use.
    Pretty,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Trace,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    // Output format for log messages
    pub format: LoggingFormat,

    /// Global log level for the application
    pub level: LogLevel,

    /// Log level for Axum web framework
    pub axum_level: LogLevel,

    /// Service name to append to logs
    pub service_name: String,

    /// Whether to enable OpenTelemetry (OTLP) exporting
    #[serde(default)]
    pub otlp_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: Default::default(),
            level: LogLevel::Info,
            axum_level: LogLevel::Info,
            service_name: "revenant".to_string(),
            otlp_enabled: false,
        }
    }
}

/// Loads configuration from the `config.yaml` file.
///
/// # Panics
/// Panics if the configuration file cannot be found or if it doesn't match the `Settings` structure.
#[tracing::instrument]
pub fn load_config() -> Settings {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(
            config::Environment::with_prefix("REVENANT")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .map_err(|e| {
            tracing::error!("Failed to build configuration: {}", e);
            e
        })
        .unwrap();

    cfg.try_deserialize::<Settings>()
        .map_err(|e| {
            tracing::error!("Failed to deserialize configuration: {}", e);
            e
        })
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.cookie_access_name, "kc-access");
        assert_eq!(settings.cookie_refresh_name, "kc-state");
        assert_eq!(settings.login_redirect_path, "/oauth/authorize");
        assert_eq!(settings.provider_timeout(), Duration::from_secs(30));
        assert!(!settings.no_redirects);
        assert!(settings.enable_authorization_header);
        assert!(settings.resources.is_empty());
    }

    #[test]
    fn test_resource_deserialization() {
        let resource: Resource = serde_json::from_value(serde_json::json!({
            "url": "/admin",
            "roles": ["admin"],
        }))
        .unwrap();

        assert_eq!(resource.url, "/admin");
        assert_eq!(resource.roles, vec!["admin"]);
        assert!(!resource.require_any_role);
        assert!(resource.groups.is_empty());
    }
}
