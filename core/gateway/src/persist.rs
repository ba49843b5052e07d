//! JSON registry files backing the file-based stores.
//!
//! The whole map is rewritten on every change through a temporary file and a
//! rename, so a crash leaves either the old or the new registry.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use storegate_common::{Error, Result};

/// A string-keyed map persisted as one JSON document.
pub struct JsonRegistry<T> {
    path: PathBuf,
    entries: BTreeMap<String, T>,
}

impl<T> JsonRegistry<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Load the registry at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    /// - The file exists but is not a valid registry
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Serialization(format!("Corrupt registry {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry and persist.
    pub async fn insert(&mut self, key: &str, value: T) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        self.persist().await
    }

    /// Remove an entry and persist; returns whether it existed.
    pub async fn remove(&mut self, key: &str) -> Result<bool> {
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry: JsonRegistry<u32> =
            JsonRegistry::open(dir.path().join("nested/registry.json"))
                .await
                .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_changes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = JsonRegistry::open(&path).await.unwrap();
        registry.insert("a", 1u32).await.unwrap();
        registry.insert("b", 2u32).await.unwrap();
        assert!(registry.remove("a").await.unwrap());
        assert!(!registry.remove("a").await.unwrap());

        let reopened: JsonRegistry<u32> = JsonRegistry::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("b"), Some(&2));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let result: Result<JsonRegistry<u32>> = JsonRegistry::open(&path).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
