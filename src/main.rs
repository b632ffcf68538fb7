use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod cookies;
mod filters;
mod identity;
mod metrics;
mod oidc;
mod provider;
mod proxy;
mod scope;
mod store;
mod telemetry;
mod upstream;

use provider::ProviderAccessToken;
use store::{MemoryStore, NullStore, SessionStore};

#[tokio::main]
async fn main() {
    let settings = config::load_config();
    let _guard = telemetry::init(&settings.telemetry);

    let oidc_client = Arc::new(oidc::OidcClient::new(&settings));

    // the provider access token is rotated out-of-band for as long as the
    // proxy runs; an initial failure is tolerated, authorization calls will
    // fail until the next rotation succeeds
    let pat = Arc::new(ProviderAccessToken::new(String::new()));
    match oidc_client.client_credentials_grant().await {
        Ok(token) => pat.rotate(token),
        Err(err) => {
            tracing::warn!(error = %err, "unable to obtain an initial provider access token")
        }
    }
    oidc::spawn_pat_refresh(
        oidc_client.clone(),
        pat.clone(),
        Duration::from_secs(settings.pat_refresh_interval_secs),
    );

    let session_store: Arc<dyn SessionStore> = if settings.enable_session_store {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(NullStore)
    };

    if settings.enable_refresh_tokens && settings.encryption_key.is_none() {
        tracing::warn!(
            "refresh tokens are enabled without an encryption key, refresh cookies cannot be issued"
        );
    }

    let state = proxy::ProxyState::new(
        Arc::new(settings),
        oidc_client.clone(),
        oidc_client.clone(),
        oidc_client,
        session_store,
        pat,
    )
    .expect("invalid proxy configuration");

    let app = proxy::router(state.clone()).expect("failed to build the filter chain");

    let addr: SocketAddr = state.config.listen.parse().expect("invalid listen address");
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
