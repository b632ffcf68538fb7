//! Session store for cached authorization decisions and rotated refresh
//! tokens.
//!
//! "Store disabled" is a capability, not a flag scattered through call
//! sites: [`NullStore`] answers `NotFound` for every read, so the filters
//! consult the same interface either way. Refresh-token rows are keyed by
//! the access token the client currently holds; on rotation the row keyed by
//! the old access token is deleted and the new refresh token is stored under
//! the new access token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;

use crate::provider::AuthzDecision;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entry found in the store")]
    NotFound,
    #[error("session store failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_authz(&self, raw_token: &str, url: &str) -> Result<AuthzDecision, StoreError>;

    async fn store_authz(
        &self,
        raw_token: &str,
        url: &str,
        decision: AuthzDecision,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn get_refresh_token(&self, access_token: &str) -> Result<String, StoreError>;

    async fn store_refresh_token(
        &self,
        access_token: &str,
        encrypted: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn delete_refresh_token(&self, access_token: &str) -> Result<(), StoreError>;

    /// Whether a real backend is present. The refresh path uses this to
    /// decide between storing a rotated refresh token and emitting it as a
    /// cookie.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// The disabled-store variant: every read misses, every write succeeds.
pub struct NullStore;

#[async_trait]
impl SessionStore for NullStore {
    async fn get_authz(&self, _raw_token: &str, _url: &str) -> Result<AuthzDecision, StoreError> {
        Err(StoreError::NotFound)
    }

    async fn store_authz(
        &self,
        _raw_token: &str,
        _url: &str,
        _decision: AuthzDecision,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_refresh_token(&self, _access_token: &str) -> Result<String, StoreError> {
        Err(StoreError::NotFound)
    }

    async fn store_refresh_token(
        &self,
        _access_token: &str,
        _encrypted: &str,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_refresh_token(&self, _access_token: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct Expiring<T> {
    value: T,
    deadline: Instant,
}

/// In-process store backed by moka caches. Entries carry their own deadline
/// because TTLs differ per entry (they follow the token's expiry).
pub struct MemoryStore {
    authz: Cache<String, Expiring<AuthzDecision>>,
    refresh: Cache<String, Expiring<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            authz: Cache::builder().max_capacity(100_000).build(),
            refresh: Cache::builder().max_capacity(100_000).build(),
        }
    }

    fn deadline(ttl: Duration) -> Instant {
        let now = Instant::now();
        now.checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn authz_key(raw_token: &str, url: &str) -> String {
    format!("{raw_token}|{url}")
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_authz(&self, raw_token: &str, url: &str) -> Result<AuthzDecision, StoreError> {
        let key = authz_key(raw_token, url);
        match self.authz.get(&key).await {
            Some(entry) if entry.deadline > Instant::now() => Ok(entry.value),
            Some(_) => {
                self.authz.invalidate(&key).await;
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn store_authz(
        &self,
        raw_token: &str,
        url: &str,
        decision: AuthzDecision,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let entry = Expiring {
            value: decision,
            deadline: Self::deadline(ttl),
        };
        self.authz.insert(authz_key(raw_token, url), entry).await;
        Ok(())
    }

    async fn get_refresh_token(&self, access_token: &str) -> Result<String, StoreError> {
        match self.refresh.get(access_token).await {
            Some(entry) if entry.deadline > Instant::now() => Ok(entry.value),
            Some(_) => {
                self.refresh.invalidate(access_token).await;
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn store_refresh_token(
        &self,
        access_token: &str,
        encrypted: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let entry = Expiring {
            value: encrypted.to_string(),
            deadline: Self::deadline(ttl),
        };
        self.refresh.insert(access_token.to_string(), entry).await;
        Ok(())
    }

    async fn delete_refresh_token(&self, access_token: &str) -> Result<(), StoreError> {
        self.refresh.invalidate(access_token).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_store_always_misses() {
        let store = NullStore;

        assert!(matches!(
            store.get_authz("token", "/api").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_refresh_token("token").await,
            Err(StoreError::NotFound)
        ));
        assert!(
            store
                .store_authz("token", "/api", AuthzDecision::Allowed, Duration::from_secs(60))
                .await
                .is_ok()
        );
        assert!(!store.is_enabled());
    }

    #[tokio::test]
    async fn test_memory_store_authz_round_trip() {
        let store = MemoryStore::new();

        store
            .store_authz("token", "/api/v1/x", AuthzDecision::Denied, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get_authz("token", "/api/v1/x").await.unwrap(),
            AuthzDecision::Denied
        );
        // different URL, different entry
        assert!(matches!(
            store.get_authz("token", "/api/v1/y").await,
            Err(StoreError::NotFound)
        ));
        // different token, different entry
        assert!(matches!(
            store.get_authz("other", "/api/v1/x").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_memory_store_expired_entry_misses() {
        let store = MemoryStore::new();

        store
            .store_authz("token", "/api", AuthzDecision::Allowed, Duration::ZERO)
            .await
            .unwrap();

        assert!(matches!(
            store.get_authz("token", "/api").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_refresh_token_rotation() {
        let store = MemoryStore::new();

        store
            .store_refresh_token("old-access", "encrypted-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get_refresh_token("old-access").await.unwrap(),
            "encrypted-1"
        );

        // rotation: delete the old row, store under the new access token
        store.delete_refresh_token("old-access").await.unwrap();
        store
            .store_refresh_token("new-access", "encrypted-2", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            store.get_refresh_token("old-access").await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(
            store.get_refresh_token("new-access").await.unwrap(),
            "encrypted-2"
        );
    }
}
