//! Transfer session persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{Mutex, RwLock};

use storegate_common::Result;

use super::session::TransferSession;
use crate::persist::JsonRegistry;

/// Storage for transfer sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TransferSession>>;

    /// Insert or replace.
    async fn put(&self, session: &TransferSession) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<bool>;

    /// Sessions in a non-terminal state.
    async fn list_active(&self) -> Result<Vec<TransferSession>>;

    async fn list_all(&self) -> Result<Vec<TransferSession>>;
}

/// Sessions held in memory only; lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, TransferSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<TransferSession>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn put(&self, session: &TransferSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn list_active(&self) -> Result<Vec<TransferSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<TransferSession>> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }
}

/// Sessions in a JSON registry file.
pub struct FileSessionStore {
    registry: Mutex<JsonRegistry<TransferSession>>,
}

impl FileSessionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(JsonRegistry::open(path).await?),
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, id: &str) -> Result<Option<TransferSession>> {
        Ok(self.registry.lock().await.get(id).cloned())
    }

    async fn put(&self, session: &TransferSession) -> Result<()> {
        self.registry
            .lock()
            .await
            .insert(&session.id, session.clone())
            .await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.registry.lock().await.remove(id).await
    }

    async fn list_active(&self) -> Result<Vec<TransferSession>> {
        Ok(self
            .registry
            .lock()
            .await
            .values()
            .filter(|s| !s.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<TransferSession>> {
        Ok(self.registry.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::session::TransferState;
    use storegate_common::{LogicalPath, SourceId, UserId};
    use storegate_storage::MultipartUpload;

    fn session() -> TransferSession {
        TransferSession::new_upload(
            UserId::new("alice").unwrap(),
            SourceId::new("mem").unwrap(),
            MultipartUpload {
                path: LogicalPath::parse("/f.bin").unwrap(),
                upload_id: "u".to_string(),
                total_size: Some(100),
                part_size: 50,
            },
        )
    }

    async fn exercise(store: &dyn SessionStore) -> String {
        let active = session();
        let mut done = session();
        done.transition(TransferState::Aborted).unwrap();

        store.put(&active).await.unwrap();
        store.put(&done).await.unwrap();

        let listed = store.list_active().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
        assert_eq!(store.list_all().await.unwrap().len(), 2);

        assert!(store.remove(&done.id).await.unwrap());
        assert!(store.get(&done.id).await.unwrap().is_none());
        active.id
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        let id = exercise(&FileSessionStore::open(&path).await.unwrap()).await;

        let reopened = FileSessionStore::open(&path).await.unwrap();
        let active = reopened.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].state, TransferState::Initiated);
    }
}
