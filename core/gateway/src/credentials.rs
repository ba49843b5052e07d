//! Credential store and broker.
//!
//! Credentials are keyed by source id. The [`CredentialBroker`] hands them to
//! adapters through [`ScopedCredentials`], refreshing expired or rejected OAuth
//! tokens at most once per source at a time.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use storegate_common::{Credential, Error, ProviderKind, Result, SourceId};
use storegate_storage::{CredentialSource, OAuthAppConfig, OAuthClient, OAuthEndpoints};

use crate::persist::JsonRegistry;
use crate::sources::SourceStore;

/// Persistent credential storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, source_id: &SourceId) -> Result<Option<Credential>>;

    async fn put(&self, source_id: &SourceId, credential: Credential) -> Result<()>;

    /// Delete the credential; returns whether one existed.
    async fn remove(&self, source_id: &SourceId) -> Result<bool>;
}

/// Credentials held in memory only.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<SourceId, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, source_id: &SourceId) -> Result<Option<Credential>> {
        Ok(self.credentials.read().await.get(source_id).cloned())
    }

    async fn put(&self, source_id: &SourceId, credential: Credential) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(source_id.clone(), credential);
        Ok(())
    }

    async fn remove(&self, source_id: &SourceId) -> Result<bool> {
        Ok(self.credentials.write().await.remove(source_id).is_some())
    }
}

/// Credentials in a JSON file, rewritten on every change.
pub struct FileCredentialStore {
    registry: Mutex<JsonRegistry<Credential>>,
}

impl FileCredentialStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(JsonRegistry::open(path).await?),
        })
    }

    pub async fn path(&self) -> PathBuf {
        self.registry.lock().await.path().to_path_buf()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, source_id: &SourceId) -> Result<Option<Credential>> {
        Ok(self.registry.lock().await.get(source_id.as_str()).cloned())
    }

    async fn put(&self, source_id: &SourceId, credential: Credential) -> Result<()> {
        self.registry
            .lock()
            .await
            .insert(source_id.as_str(), credential)
            .await
    }

    async fn remove(&self, source_id: &SourceId) -> Result<bool> {
        self.registry.lock().await.remove(source_id.as_str()).await
    }
}

/// Obtains a replacement for an expired or rejected credential.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, source_id: &SourceId, current: &Credential) -> Result<Credential>;
}

/// OAuth settings carried in a source's provider settings under `oauth`.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    #[serde(flatten)]
    pub app: OAuthAppConfig,
    /// Microsoft tenant; "common" when absent.
    #[serde(default)]
    pub tenant: Option<String>,
}

impl OAuthSettings {
    /// Read the `oauth` section of a source's settings.
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self> {
        let section = settings
            .get("oauth")
            .ok_or_else(|| Error::InvalidInput("Source has no OAuth settings".to_string()))?;
        serde_json::from_value(section.clone())
            .map_err(|e| Error::InvalidInput(format!("Invalid OAuth settings: {}", e)))
    }

    /// Endpoints of the identity provider behind `kind`.
    pub fn endpoints(&self, kind: ProviderKind) -> Result<OAuthEndpoints> {
        match kind {
            ProviderKind::GoogleDrive => Ok(OAuthEndpoints::google()),
            ProviderKind::OneDrive => Ok(OAuthEndpoints::microsoft(
                self.tenant.as_deref().unwrap_or("common"),
            )),
            other => Err(Error::InvalidInput(format!(
                "{} sources do not use OAuth",
                other
            ))),
        }
    }

    pub fn client(&self, kind: ProviderKind) -> Result<OAuthClient> {
        OAuthClient::new(self.endpoints(kind)?, &self.app)
    }
}

/// Refreshes OAuth tokens using the client registered in the source's settings.
pub struct OAuthRefresher {
    sources: Arc<dyn SourceStore>,
}

impl OAuthRefresher {
    pub fn new(sources: Arc<dyn SourceStore>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl CredentialRefresher for OAuthRefresher {
    async fn refresh(&self, source_id: &SourceId, current: &Credential) -> Result<Credential> {
        let refresh_token = current.refresh_token().ok_or_else(|| {
            Error::Authentication(format!("Credential for {} cannot be refreshed", source_id))
        })?;
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", source_id)))?;

        let client = OAuthSettings::from_settings(&source.settings)?.client(source.kind)?;
        client.refresh(refresh_token).await
    }
}

/// Single-flight credential resolution and refresh.
pub struct CredentialBroker {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn CredentialRefresher>,
    /// One refresh lock per source.
    refresh_locks: Mutex<HashMap<SourceId, Arc<Mutex<()>>>>,
}

impl CredentialBroker {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            store,
            refresher,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    async fn refresh_lock(&self, source_id: &SourceId) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(source_id.clone())
            .or_default()
            .clone()
    }

    /// Current, unexpired credential for a source.
    ///
    /// # Errors
    /// - `Authentication` if no credential is stored or it cannot be refreshed
    pub async fn get(&self, source_id: &SourceId) -> Result<Credential> {
        let credential = self.stored(source_id).await?;
        if !credential.is_expired() {
            return Ok(credential);
        }
        self.refresh(source_id, Some(&credential)).await
    }

    async fn stored(&self, source_id: &SourceId) -> Result<Credential> {
        self.store.get(source_id).await?.ok_or_else(|| {
            Error::Authentication(format!("No credential for source {}", source_id))
        })
    }

    /// Refresh a source's credential.
    ///
    /// `stale` is the credential the caller saw fail or expire. If another
    /// caller replaced it in the meantime the replacement is returned without
    /// contacting the identity provider.
    pub async fn refresh(&self, source_id: &SourceId, stale: Option<&Credential>) -> Result<Credential> {
        let lock = self.refresh_lock(source_id).await;
        let _guard = lock.lock().await;

        // Double-check after acquiring the lock
        let current = self.stored(source_id).await?;
        if let Some(stale) = stale {
            if &current != stale && !current.is_expired() {
                debug!(source = %source_id, "Credential already refreshed");
                return Ok(current);
            }
        }

        info!(source = %source_id, "Refreshing credential");
        let refreshed = self.refresher.refresh(source_id, &current).await?;
        self.store.put(source_id, refreshed.clone()).await?;
        Ok(refreshed)
    }

    /// Remove a source's credential. The source behaves as disabled afterwards.
    pub async fn revoke(&self, source_id: &SourceId) -> Result<bool> {
        let removed = self.store.remove(source_id).await?;
        self.refresh_locks.lock().await.remove(source_id);
        if removed {
            info!(source = %source_id, "Credential revoked");
        }
        Ok(removed)
    }

    /// Whether a credential is stored for the source.
    pub async fn has_credential(&self, source_id: &SourceId) -> Result<bool> {
        Ok(self.store.get(source_id).await?.is_some())
    }
}

/// The broker bound to one source, handed to that source's adapter.
pub struct ScopedCredentials {
    broker: Arc<CredentialBroker>,
    source_id: SourceId,
}

impl ScopedCredentials {
    pub fn new(broker: Arc<CredentialBroker>, source_id: SourceId) -> Self {
        Self { broker, source_id }
    }
}

#[async_trait]
impl CredentialSource for ScopedCredentials {
    async fn credential(&self) -> Result<Credential> {
        self.broker.get(&self.source_id).await
    }

    async fn refresh_after_rejection(&self, rejected: &Credential) -> Result<Credential> {
        self.broker.refresh(&self.source_id, Some(rejected)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use storegate_common::{CredentialSecret, SensitiveString};

    struct CountingRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self, _source_id: &SourceId, _current: &Credential) -> Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(oauth(&format!("fresh-{}", n), Utc::now() + Duration::hours(1)))
        }
    }

    fn oauth(token: &str, expires_at: chrono::DateTime<Utc>) -> Credential {
        Credential::new(
            CredentialSecret::OAuth {
                access_token: SensitiveString::new(token),
                refresh_token: Some(SensitiveString::new("refresh")),
            },
            Some(expires_at),
        )
    }

    fn source() -> SourceId {
        SourceId::new("drive").unwrap()
    }

    async fn broker_with(credential: Credential) -> (Arc<CredentialBroker>, Arc<CountingRefresher>) {
        let store = Arc::new(MemoryCredentialStore::new());
        store.put(&source(), credential).await.unwrap();
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let broker = Arc::new(CredentialBroker::new(store, refresher.clone()));
        (broker, refresher)
    }

    #[tokio::test]
    async fn test_valid_credential_is_not_refreshed() {
        let (broker, refresher) = broker_with(oauth("ok", Utc::now() + Duration::hours(1))).await;
        let credential = broker.get(&source()).await.unwrap();
        assert_eq!(credential.bearer_token(), Some("ok"));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_expired_resolutions_refresh_once() {
        let (broker, refresher) = broker_with(oauth("old", Utc::now() - Duration::hours(1))).await;

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.get(&source()).await })
            })
            .collect();

        for task in tasks {
            let credential = task.await.unwrap().unwrap();
            assert_eq!(credential.bearer_token(), Some("fresh-0"));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_after_refresh_reuses_replacement() {
        let original = oauth("first", Utc::now() + Duration::hours(1));
        let (broker, refresher) = broker_with(original.clone()).await;
        let scoped = ScopedCredentials::new(broker.clone(), source());

        let first = scoped.refresh_after_rejection(&original).await.unwrap();
        let second = scoped.refresh_after_rejection(&original).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoked_source_has_no_credential() {
        let (broker, _) = broker_with(oauth("x", Utc::now() + Duration::hours(1))).await;
        assert!(broker.revoke(&source()).await.unwrap());
        assert!(!broker.revoke(&source()).await.unwrap());

        let err = broker.get(&source()).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let credential = oauth("persisted", Utc::now() + Duration::hours(1));

        {
            let store = FileCredentialStore::open(&path).await.unwrap();
            store.put(&source(), credential.clone()).await.unwrap();
        }

        let reopened = FileCredentialStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&source()).await.unwrap(), Some(credential));
        assert!(reopened.remove(&source()).await.unwrap());
        assert_eq!(reopened.get(&source()).await.unwrap(), None);
    }

    #[test]
    fn test_oauth_settings() {
        let settings = serde_json::json!({
            "oauth": {"client_id": "abc", "tenant": "contoso"}
        });
        let oauth = OAuthSettings::from_settings(&settings).unwrap();
        assert_eq!(oauth.app.client_id, "abc");
        let endpoints = oauth.endpoints(ProviderKind::OneDrive).unwrap();
        assert!(endpoints.token_url.contains("/contoso/"));
        assert!(oauth.endpoints(ProviderKind::S3Compatible).is_err());
        assert!(OAuthSettings::from_settings(&serde_json::json!({})).is_err());
    }
}
