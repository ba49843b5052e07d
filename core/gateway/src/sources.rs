//! Storage source records and their persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{Mutex, RwLock};

use storegate_common::{ProviderKind, Result, SourceId, UserId};
use storegate_storage::AdapterConfig;

use crate::persist::JsonRegistry;

/// A configured connection to one storage account.
///
/// The credential for a source is stored under its id. Only the display name
/// and the enabled flag change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSource {
    pub id: SourceId,
    pub kind: ProviderKind,
    pub display_name: String,
    /// Bucket, drive id or root folder id.
    pub root_scope: String,
    pub owner: UserId,
    /// Provider settings: endpoint, region, addressing style, OAuth client.
    #[serde(default)]
    pub settings: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageSource {
    pub fn new(
        id: SourceId,
        kind: ProviderKind,
        display_name: impl Into<String>,
        root_scope: impl Into<String>,
        owner: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            display_name: display_name.into(),
            root_scope: root_scope.into(),
            owner,
            settings: Value::Null,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Adapter construction parameters for this source.
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig::new(self.id.clone(), self.root_scope.clone())
            .with_settings(self.settings.clone())
    }
}

/// Caller-supplied fields of a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub id: SourceId,
    pub kind: ProviderKind,
    pub display_name: String,
    #[serde(default)]
    pub root_scope: String,
    #[serde(default)]
    pub settings: Value,
}

impl NewSource {
    pub fn into_source(self, owner: UserId) -> StorageSource {
        StorageSource::new(self.id, self.kind, self.display_name, self.root_scope, owner)
            .with_settings(self.settings)
    }
}

/// Persistence for storage sources.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get(&self, id: &SourceId) -> Result<Option<StorageSource>>;

    async fn put(&self, source: StorageSource) -> Result<()>;

    async fn remove(&self, id: &SourceId) -> Result<bool>;

    /// Sources owned by `owner`, ordered by id.
    async fn list_for(&self, owner: &UserId) -> Result<Vec<StorageSource>>;
}

/// Sources held in memory only.
#[derive(Default)]
pub struct MemorySourceStore {
    sources: RwLock<HashMap<SourceId, StorageSource>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn get(&self, id: &SourceId) -> Result<Option<StorageSource>> {
        Ok(self.sources.read().await.get(id).cloned())
    }

    async fn put(&self, source: StorageSource) -> Result<()> {
        self.sources.write().await.insert(source.id.clone(), source);
        Ok(())
    }

    async fn remove(&self, id: &SourceId) -> Result<bool> {
        Ok(self.sources.write().await.remove(id).is_some())
    }

    async fn list_for(&self, owner: &UserId) -> Result<Vec<StorageSource>> {
        let mut sources: Vec<_> = self
            .sources
            .read()
            .await
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sources)
    }
}

/// Sources in a JSON registry file.
pub struct FileSourceStore {
    registry: Mutex<JsonRegistry<StorageSource>>,
}

impl FileSourceStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(JsonRegistry::open(path).await?),
        })
    }
}

#[async_trait]
impl SourceStore for FileSourceStore {
    async fn get(&self, id: &SourceId) -> Result<Option<StorageSource>> {
        Ok(self.registry.lock().await.get(id.as_str()).cloned())
    }

    async fn put(&self, source: StorageSource) -> Result<()> {
        let key = source.id.as_str().to_string();
        self.registry.lock().await.insert(&key, source).await
    }

    async fn remove(&self, id: &SourceId) -> Result<bool> {
        self.registry.lock().await.remove(id.as_str()).await
    }

    async fn list_for(&self, owner: &UserId) -> Result<Vec<StorageSource>> {
        // Registry keys are ordered, so the result is ordered by id.
        Ok(self
            .registry
            .lock()
            .await
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, owner: &str) -> StorageSource {
        StorageSource::new(
            SourceId::new(id).unwrap(),
            ProviderKind::Memory,
            id.to_uppercase(),
            "",
            UserId::new(owner).unwrap(),
        )
    }

    async fn exercise(store: &dyn SourceStore) {
        store.put(source("b", "alice")).await.unwrap();
        store.put(source("a", "alice")).await.unwrap();
        store.put(source("c", "bob")).await.unwrap();

        let alice = store.list_for(&UserId::new("alice").unwrap()).await.unwrap();
        let ids: Vec<_> = alice.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.remove(&SourceId::new("a").unwrap()).await.unwrap());
        assert!(store.get(&SourceId::new("a").unwrap()).await.unwrap().is_none());
        assert!(!store.remove(&SourceId::new("a").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemorySourceStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        exercise(&FileSourceStore::open(&path).await.unwrap()).await;

        let reopened = FileSourceStore::open(&path).await.unwrap();
        let c = reopened.get(&SourceId::new("c").unwrap()).await.unwrap().unwrap();
        assert_eq!(c.display_name, "C");
        assert_eq!(c.kind, ProviderKind::Memory);
    }

    #[test]
    fn test_adapter_config_carries_settings() {
        let source = source("s3", "alice")
            .with_settings(serde_json::json!({"region": "eu-west-1"}));
        let config = source.adapter_config();
        assert_eq!(config.source_id.as_str(), "s3");
        assert_eq!(config.settings["region"], "eu-west-1");
    }
}
