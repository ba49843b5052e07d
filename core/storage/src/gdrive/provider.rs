//! Google Drive storage adapter implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use storegate_common::{ByteRange, Error, FileEntry, LogicalPath, ProviderKind, Result};

use crate::provider::{
    ByteStream, ListPage, MultipartUpload, PartLimits, PartReceipt, PartUpload, RateLimitSignal,
    RateQuota, ShareLink, StorageAdapter, WriteOptions,
};

use super::client::{ChunkOutcome, DriveClient, DriveFile};

/// Resumable chunks must be multiples of 256 KiB.
const CHUNK_ALIGNMENT: u64 = 256 * 1024;

const LIMITS: PartLimits = PartLimits {
    min_part_size: CHUNK_ALIGNMENT,
    max_part_size: 256 * 1024 * 1024,
    max_parts: u32::MAX,
    alignment: CHUNK_ALIGNMENT,
    independent_parts: false,
    simple_upload_limit: 5 * 1024 * 1024,
};

/// Google Drive storage adapter.
///
/// Drive addresses items by id; logical paths are resolved by walking the
/// tree from the root folder, with a path to id cache in front.
pub struct GDriveAdapter {
    root_folder_id: String,
    client: DriveClient,
    /// Cache of path to file ID mapping.
    path_cache: RwLock<HashMap<String, String>>,
}

impl GDriveAdapter {
    /// Create a new Google Drive adapter rooted at `root_folder_id`.
    pub fn new(root_folder_id: impl Into<String>, client: DriveClient) -> Self {
        let root_folder_id = root_folder_id.into();
        let mut path_cache = HashMap::new();
        path_cache.insert("/".to_string(), root_folder_id.clone());

        Self {
            root_folder_id,
            client,
            path_cache: RwLock::new(path_cache),
        }
    }

    /// Resolve a logical path to a Google Drive file ID.
    async fn resolve_path(&self, path: &LogicalPath) -> Result<String> {
        let path_str = path.to_string_path();

        {
            let cache = self.path_cache.read().await;
            if let Some(id) = cache.get(&path_str) {
                return Ok(id.clone());
            }
        }

        let mut current_id = self.root_folder_id.clone();
        let mut current_path = LogicalPath::root();

        for (component, name) in path.components().iter().zip(path.native_components()) {
            current_path = current_path.join(component)?;
            let key = current_path.to_string_path();

            {
                let cache = self.path_cache.read().await;
                if let Some(id) = cache.get(&key) {
                    current_id = id.clone();
                    continue;
                }
            }

            let file = self
                .client
                .find_file(&name, &current_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Path not found: {}", current_path)))?;

            current_id = file.id;
            self.path_cache.write().await.insert(key, current_id.clone());
        }

        Ok(current_id)
    }

    /// Resolve parent path and return (parent_id, name).
    async fn resolve_parent(&self, path: &LogicalPath) -> Result<(String, String)> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput("Cannot get parent of root path".to_string()))?;
        let name = path
            .native_name()
            .ok_or_else(|| Error::InvalidInput("Path has no name".to_string()))?;

        let parent_id = self.resolve_path(&parent).await?;
        Ok((parent_id, name))
    }

    /// Look up the item at `path`, `None` when absent.
    async fn lookup(&self, path: &LogicalPath) -> Result<Option<DriveFile>> {
        match self.resolve_path(path).await {
            Ok(id) => match self.client.get_file(&id).await {
                Ok(file) if !file.trashed => Ok(Some(file)),
                Ok(_) => {
                    self.invalidate(path).await;
                    Ok(None)
                }
                Err(Error::NotFound(_)) => {
                    self.invalidate(path).await;
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cache_path(&self, path: &LogicalPath, id: &str) {
        self.path_cache
            .write()
            .await
            .insert(path.to_string_path(), id.to_string());
    }

    /// Drop cached ids for `path` and everything beneath it.
    async fn invalidate(&self, path: &LogicalPath) {
        let prefix = path.to_string_path();
        let nested = format!("{}/", prefix);
        self.path_cache
            .write()
            .await
            .retain(|key, _| key != &prefix && !key.starts_with(&nested));
    }

    fn to_entry(file: &DriveFile, path: LogicalPath) -> FileEntry {
        let modified = file.modified_time.or(file.created_time).unwrap_or_else(Utc::now);
        if file.is_folder() {
            FileEntry::folder(file.id.clone(), path, modified)
        } else {
            FileEntry::file(
                file.id.clone(),
                path,
                file.size_bytes().unwrap_or(0),
                modified,
                file.md5_checksum.clone(),
            )
        }
    }

    async fn require_file(&self, path: &LogicalPath) -> Result<DriveFile> {
        self.lookup(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }
}

#[async_trait]
impl StorageAdapter for GDriveAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn part_limits(&self) -> PartLimits {
        LIMITS
    }

    fn rate_quota(&self) -> Option<RateQuota> {
        // 12,000 queries per minute per project.
        Some(RateQuota {
            per_second: 200.0,
            burst: 100,
        })
    }

    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        self.client.rate_limit_signal()
    }

    async fn list(
        &self,
        path: &LogicalPath,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage> {
        let folder = self.require_file(path).await?;
        if !folder.is_folder() {
            return Err(Error::InvalidInput(format!("Not a folder: {}", path)));
        }

        let page = self
            .client
            .list_page(&folder.id, page_token, page_size)
            .await
            .map_err(|e| match (e, page_token) {
                (Error::InvalidInput(msg), Some(_)) => {
                    Error::InvalidCursor(format!("Drive rejected page token: {}", msg))
                }
                (e, _) => e,
            })?;

        let mut entries = Vec::with_capacity(page.files.len());
        for file in &page.files {
            let child_path = match path.join_native(&file.name) {
                Ok(child) => child,
                Err(e) => {
                    warn!(path = %path, file = %file.id, "Skipping unlistable file: {}", e);
                    continue;
                }
            };
            self.cache_path(&child_path, &file.id).await;
            entries.push(Self::to_entry(file, child_path));
        }

        debug!(path = %path, count = entries.len(), "Listed Drive folder");
        Ok(ListPage {
            entries,
            next_token: page.next_page_token,
        })
    }

    async fn stat(&self, path: &LogicalPath) -> Result<FileEntry> {
        let file = self.require_file(path).await?;
        Ok(Self::to_entry(&file, path.clone()))
    }

    async fn read(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream> {
        let file = self.require_file(path).await?;
        if file.is_folder() {
            return Err(Error::InvalidInput(format!("Cannot read a folder: {}", path)));
        }
        self.client.download_stream(&file.id, range).await
    }

    async fn write(
        &self,
        path: &LogicalPath,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        let (parent_id, name) = self.resolve_parent(path).await?;
        let existing = self.client.find_file(&name, &parent_id).await?;

        let file = match existing {
            Some(existing) if existing.is_folder() => {
                return Err(Error::Conflict(format!("A folder exists at {}", path)));
            }
            Some(existing) => {
                if !options.overwrite {
                    return Err(Error::Conflict(format!("File already exists: {}", path)));
                }
                if let Some(expected) = &options.if_match {
                    if existing.md5_checksum.as_deref() != Some(expected.as_str()) {
                        return Err(Error::Conflict(format!("Etag mismatch for {}", path)));
                    }
                }
                self.client.update_file(&existing.id, data).await?
            }
            None => {
                if options.if_match.is_some() {
                    return Err(Error::Conflict(format!("Etag mismatch for {}", path)));
                }
                self.client.upload_simple(&name, &parent_id, data).await?
            }
        };

        self.cache_path(path, &file.id).await;
        Ok(Self::to_entry(&file, path.clone()))
    }

    async fn begin_multipart(
        &self,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Result<MultipartUpload> {
        if part_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidInput(format!(
                "Part size {} is not a multiple of {}",
                part_size, CHUNK_ALIGNMENT
            )));
        }

        let (parent_id, name) = self.resolve_parent(path).await?;
        let existing = self.client.find_file(&name, &parent_id).await?;
        if let Some(file) = &existing {
            if file.is_folder() {
                return Err(Error::Conflict(format!("A folder exists at {}", path)));
            }
        }

        let upload_id = self
            .client
            .start_resumable_upload(
                &name,
                &parent_id,
                existing.as_ref().map(|f| f.id.as_str()),
                total_size,
            )
            .await?;

        Ok(MultipartUpload {
            path: path.clone(),
            upload_id,
            total_size,
            part_size,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part: &PartUpload,
    ) -> Result<PartReceipt> {
        // The session learns the total on the final chunk when it was unknown.
        let total = upload
            .total_size
            .or_else(|| part.is_last.then(|| part.offset + part.data.len() as u64));

        match self
            .client
            .upload_chunk(&upload.upload_id, part.data.clone(), part.offset, total)
            .await?
        {
            ChunkOutcome::Incomplete => Ok(PartReceipt {
                index: part.index,
                token: None,
            }),
            ChunkOutcome::Complete(file) => {
                self.cache_path(&upload.path, &file.id).await;
                Ok(PartReceipt {
                    index: part.index,
                    token: Some(file.id),
                })
            }
        }
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartReceipt],
    ) -> Result<FileEntry> {
        let file_id = match parts.last().and_then(|p| p.token.clone()) {
            Some(id) => id,
            None => match self
                .client
                .query_upload(&upload.upload_id, upload.total_size)
                .await?
            {
                ChunkOutcome::Complete(file) => file.id,
                ChunkOutcome::Incomplete => {
                    return Err(Error::Conflict(format!(
                        "Upload to {} has not received all bytes",
                        upload.path
                    )));
                }
            },
        };

        let file = self.client.get_file(&file_id).await?;
        self.cache_path(&upload.path, &file.id).await;
        Ok(Self::to_entry(&file, upload.path.clone()))
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<()> {
        self.client.cancel_upload(&upload.upload_id).await
    }

    async fn delete(&self, path: &LogicalPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete the root".to_string()));
        }
        let file = self.require_file(path).await?;

        if file.is_folder() {
            let children = self.client.list_page(&file.id, None, 1).await?;
            if !children.files.is_empty() {
                return Err(Error::Conflict(format!("Folder is not empty: {}", path)));
            }
        }

        self.client.delete(&file.id).await?;
        self.invalidate(path).await;
        Ok(())
    }

    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        overwrite: bool,
    ) -> Result<FileEntry> {
        if from.is_root() || to.is_root() {
            return Err(Error::InvalidInput("Cannot move the root".to_string()));
        }
        if from.contains(to) && from != to {
            return Err(Error::InvalidInput(format!(
                "Cannot move {} inside itself",
                from
            )));
        }

        let source = self.require_file(from).await?;
        let (from_parent_id, _) = self.resolve_parent(from).await?;
        let (to_parent_id, to_name) = self.resolve_parent(to).await?;

        if let Some(existing) = self.client.find_file(&to_name, &to_parent_id).await? {
            if existing.id == source.id {
                return Ok(Self::to_entry(&source, to.clone()));
            }
            if existing.is_folder() || source.is_folder() || !overwrite {
                return Err(Error::Conflict(format!("Destination exists: {}", to)));
            }
            self.client.delete(&existing.id).await?;
            self.invalidate(to).await;
        }

        let new_parent = (from_parent_id != to_parent_id).then_some(to_parent_id.as_str());
        let moved = self
            .client
            .move_file(&source.id, &to_name, new_parent, Some(&from_parent_id))
            .await?;

        self.invalidate(from).await;
        self.cache_path(to, &moved.id).await;
        Ok(Self::to_entry(&moved, to.clone()))
    }

    async fn create_folder(&self, path: &LogicalPath) -> Result<FileEntry> {
        let (parent_id, name) = self.resolve_parent(path).await?;

        if self.client.find_file(&name, &parent_id).await?.is_some() {
            return Err(Error::Conflict(format!("Path already exists: {}", path)));
        }

        let folder = self.client.create_folder(&name, &parent_id).await?;
        self.cache_path(path, &folder.id).await;
        Ok(Self::to_entry(&folder, path.clone()))
    }

    async fn share_link(&self, path: &LogicalPath, _expires_in: Duration) -> Result<ShareLink> {
        let file = self.require_file(path).await?;
        self.client.share_anyone_reader(&file.id).await?;

        let file = self.client.get_file(&file.id).await?;
        let url = file
            .web_view_link
            .ok_or_else(|| Error::Unknown(format!("Drive returned no link for {}", path)))?;

        // "anyone" permissions cannot carry an expiration time.
        Ok(ShareLink {
            url,
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storegate_common::Credential;

    use crate::provider::StaticCredentials;

    fn adapter() -> GDriveAdapter {
        let client = DriveClient::new(Arc::new(StaticCredentials::new(Credential::anonymous())))
            .unwrap();
        GDriveAdapter::new("root-folder", client)
    }

    #[tokio::test]
    async fn test_root_resolves_from_cache() {
        let adapter = adapter();
        let id = adapter.resolve_path(&LogicalPath::root()).await.unwrap();
        assert_eq!(id, "root-folder");
    }

    #[tokio::test]
    async fn test_invalidate_drops_subtree() {
        let adapter = adapter();
        let docs = LogicalPath::parse("/docs").unwrap();
        let nested = LogicalPath::parse("/docs/a.txt").unwrap();
        let sibling = LogicalPath::parse("/docs2").unwrap();
        adapter.cache_path(&docs, "1").await;
        adapter.cache_path(&nested, "2").await;
        adapter.cache_path(&sibling, "3").await;

        adapter.invalidate(&docs).await;

        let cache = adapter.path_cache.read().await;
        assert!(!cache.contains_key("/docs"));
        assert!(!cache.contains_key("/docs/a.txt"));
        assert!(cache.contains_key("/docs2"));
        assert!(cache.contains_key("/"));
    }

    #[tokio::test]
    async fn test_names_with_separators_map_back() {
        let adapter = adapter();
        let reports = LogicalPath::parse("/reports").unwrap();
        adapter.cache_path(&reports, "reports-id").await;

        let file: DriveFile = serde_json::from_str(
            r#"{"id": "f1", "name": "2024/01 summary.pdf", "mimeType": "application/pdf", "size": "12"}"#,
        )
        .unwrap();
        let path = reports.join_native(&file.name).unwrap();
        let entry = GDriveAdapter::to_entry(&file, path.clone());
        assert_eq!(entry.name, "2024/01 summary.pdf");
        assert_eq!(entry.path.parent().unwrap(), reports);
        assert_eq!(entry.size, Some(12));

        let (parent_id, name) = adapter.resolve_parent(&path).await.unwrap();
        assert_eq!(parent_id, "reports-id");
        assert_eq!(name, "2024/01 summary.pdf");
    }

    #[test]
    fn test_limits_are_aligned() {
        assert!(!LIMITS.independent_parts);
        let size = LIMITS.negotiate(1_000_000, Some(10_000_000));
        assert_eq!(size % CHUNK_ALIGNMENT, 0);
    }

    #[tokio::test]
    async fn test_misaligned_part_size_rejected() {
        let adapter = adapter();
        let path = LogicalPath::parse("/big.bin").unwrap();
        let err = adapter.begin_multipart(&path, None, 1000).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
