//! Proxy state and filter-chain assembly.

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{from_fn, from_fn_with_state};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::Settings;
use crate::cookies::TokenCipher;
use crate::filters;
use crate::filters::admission::AdmissionPolicy;
use crate::metrics::RequestMetrics;
use crate::provider::{AuthorizationProvider, ProviderAccessToken, TokenRefresher, TokenVerifier};
use crate::store::SessionStore;
use crate::upstream;

/// Everything the filters share: configuration, the provider seams, the
/// session store, the cookie cipher, and the process-wide provider access
/// token. Cheap to clone; all members are shared handles.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Settings>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub refresher: Arc<dyn TokenRefresher>,
    pub authz: Arc<dyn AuthorizationProvider>,
    pub store: Arc<dyn SessionStore>,
    pub cipher: Option<Arc<TokenCipher>>,
    pub pat: Arc<ProviderAccessToken>,
    pub metrics: RequestMetrics,
    pub http: reqwest::Client,
    pub claim_headers: Arc<Vec<(String, HeaderName)>>,
    pub request_id_header: HeaderName,
}

impl ProxyState {
    pub fn new(
        config: Arc<Settings>,
        verifier: Arc<dyn TokenVerifier>,
        refresher: Arc<dyn TokenRefresher>,
        authz: Arc<dyn AuthorizationProvider>,
        store: Arc<dyn SessionStore>,
        pat: Arc<ProviderAccessToken>,
    ) -> anyhow::Result<Self> {
        let cipher = match &config.encryption_key {
            Some(key) => Some(Arc::new(TokenCipher::new(key)?)),
            None => None,
        };
        let claim_headers = Arc::new(filters::headers::claim_header_mappings(&config.add_claims)?);
        let request_id_header = HeaderName::from_bytes(config.request_id_header.as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid request id header name"))?;

        Ok(Self {
            config,
            verifier,
            refresher,
            authz,
            store,
            cipher,
            pat,
            metrics: RequestMetrics::new(),
            http: reqwest::Client::new(),
            claim_headers,
            request_id_header,
        })
    }
}

/// Assembles the filter chain.
///
/// Each configured resource becomes a nested router carrying the protected
/// chain (authentication → authorization → admission → identity headers) in
/// front of the upstream forwarder. Everything else is either forwarded
/// untouched or denied, per configuration. The global filters (entry,
/// request-id, access log, security, method check) wrap the whole router so
/// URL normalization happens before any routing decision.
pub fn router(state: ProxyState) -> anyhow::Result<Router> {
    let mut app: Router<ProxyState> = Router::new();
    let mut root_resource: Option<Router<ProxyState>> = None;

    for resource in &state.config.resources {
        let policy = Arc::new(AdmissionPolicy::new(
            resource.clone(),
            &state.config.match_claims,
        )?);

        let protected: Router<ProxyState> = Router::new().fallback(upstream::forward);
        let protected: Router<ProxyState> = protected.layer(from_fn_with_state(
            state.clone(),
            filters::headers::identity_headers,
        ));
        let protected: Router<ProxyState> =
            protected.layer(from_fn_with_state(policy, filters::admission::admission));
        let protected: Router<ProxyState> = protected.layer(from_fn_with_state(
            state.clone(),
            filters::authz::authorization,
        ));
        let protected: Router<ProxyState> = protected.layer(from_fn_with_state(
            state.clone(),
            filters::auth::authentication,
        ));

        let prefix = resource.url.trim_end_matches('*').trim_end_matches('/');
        if prefix.is_empty() {
            root_resource = Some(protected);
        } else if prefix.starts_with('/') {
            app = app.nest(prefix, protected);
        } else {
            return Err(anyhow::anyhow!(
                "resource url must begin with a slash: {}",
                resource.url
            ));
        }
    }

    app = match root_resource {
        Some(protected) => app.merge(protected),
        None if state.config.enable_default_deny => app.fallback(filters::deny::deny),
        None => app.fallback(upstream::forward),
    };

    // configured response headers apply to every response
    for (name, value) in &state.config.response_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid response header name: {}", name))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| anyhow::anyhow!("invalid response header value for {}", name))?;
        app = app.layer(SetResponseHeaderLayer::overriding(name, value));
    }

    // global filters; the last layer added runs first
    app = app.layer(from_fn(filters::security::method_check));
    app = app.layer(from_fn_with_state(state.clone(), filters::security::security));
    app = app.layer(from_fn(filters::entry::access_log));
    if state.config.enable_request_id {
        app = app.layer(from_fn_with_state(
            state.clone(),
            filters::request_id::request_id,
        ));
    }
    app = app.layer(from_fn_with_state(state.clone(), filters::entry::entrypoint));

    Ok(app.with_state(state))
}
