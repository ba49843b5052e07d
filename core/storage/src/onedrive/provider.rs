//! OneDrive storage adapter implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

use storegate_common::{ByteRange, Error, FileEntry, LogicalPath, ProviderKind, Result};

use crate::provider::{
    ByteStream, ListPage, MultipartUpload, PartLimits, PartReceipt, PartUpload, RateLimitSignal,
    RateQuota, ShareLink, StorageAdapter, WriteOptions,
};

use super::client::{ConflictBehavior, DriveItem, FragmentOutcome, GraphClient};

/// Upload session fragments must be multiples of 320 KiB.
const FRAGMENT_ALIGNMENT: u64 = 320 * 1024;

const LIMITS: PartLimits = PartLimits {
    min_part_size: FRAGMENT_ALIGNMENT,
    // Graph rejects fragments above 60 MiB.
    max_part_size: 60 * 1024 * 1024 - (60 * 1024 * 1024) % FRAGMENT_ALIGNMENT,
    max_parts: u32::MAX,
    alignment: FRAGMENT_ALIGNMENT,
    independent_parts: false,
    simple_upload_limit: 4 * 1024 * 1024,
};

/// OneDrive storage adapter over Microsoft Graph.
pub struct OneDriveAdapter {
    client: GraphClient,
}

impl OneDriveAdapter {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    fn to_entry(item: &DriveItem, path: LogicalPath) -> FileEntry {
        let modified = item.last_modified_date_time.unwrap_or_else(Utc::now);
        if item.is_folder() {
            FileEntry::folder(item.id.clone(), path, modified)
        } else {
            FileEntry::file(
                item.id.clone(),
                path,
                item.size.unwrap_or(0),
                modified,
                item.e_tag.clone(),
            )
        }
    }

    async fn require_item(&self, path: &LogicalPath) -> Result<DriveItem> {
        self.client
            .get_item(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    /// Graph creates missing parents on upload; the gateway does not.
    async fn require_parent_folder(&self, path: &LogicalPath) -> Result<DriveItem> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput("Root has no parent".to_string()))?;
        let item = self
            .client
            .get_item(&parent)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Parent folder not found: {}", parent)))?;
        if !item.is_folder() {
            return Err(Error::Conflict(format!("Parent is not a folder: {}", parent)));
        }
        Ok(item)
    }
}

#[async_trait]
impl StorageAdapter for OneDriveAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
    }

    fn part_limits(&self) -> PartLimits {
        LIMITS
    }

    fn rate_quota(&self) -> Option<RateQuota> {
        Some(RateQuota {
            per_second: 16.0,
            burst: 32,
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
        let page = match page_token {
            Some(link) => {
                if !self.client.owns_link(link) {
                    return Err(Error::InvalidCursor(
                        "Page token is not a Graph link".to_string(),
                    ));
                }
                self.client.next_children(link).await.map_err(|e| match e {
                    Error::InvalidInput(msg) | Error::NotFound(msg) => {
                        Error::InvalidCursor(format!("Graph rejected page link: {}", msg))
                    }
                    e => e,
                })?
            }
            None => {
                let folder = self.require_item(path).await?;
                if !folder.is_folder() {
                    return Err(Error::InvalidInput(format!("Not a folder: {}", path)));
                }
                self.client.list_children(path, page_size).await?
            }
        };

        let mut entries = Vec::with_capacity(page.value.len());
        for item in &page.value {
            match path.join_native(&item.name) {
                Ok(child) => entries.push(Self::to_entry(item, child)),
                Err(e) => warn!(path = %path, item = %item.id, "Skipping unlistable item: {}", e),
            }
        }

        debug!(path = %path, count = entries.len(), "Listed OneDrive folder");
        Ok(ListPage {
            entries,
            next_token: page.next_link,
        })
    }

    async fn stat(&self, path: &LogicalPath) -> Result<FileEntry> {
        let item = self.require_item(path).await?;
        Ok(Self::to_entry(&item, path.clone()))
    }

    async fn read(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream> {
        let item = self.require_item(path).await?;
        if item.is_folder() {
            return Err(Error::InvalidInput(format!("Cannot read a folder: {}", path)));
        }
        self.client.download(path, range).await
    }

    async fn write(
        &self,
        path: &LogicalPath,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        self.require_parent_folder(path).await?;

        if options.if_match.is_some() && self.client.get_item(path).await?.is_none() {
            return Err(Error::Conflict(format!("Etag mismatch for {}", path)));
        }

        let behavior = if options.overwrite {
            ConflictBehavior::Replace
        } else {
            ConflictBehavior::Fail
        };
        let item = self
            .client
            .put_content(path, data, behavior, options.if_match.as_deref())
            .await?;

        Ok(Self::to_entry(&item, path.clone()))
    }

    async fn begin_multipart(
        &self,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Result<MultipartUpload> {
        if total_size.is_none() {
            return Err(Error::InvalidInput(
                "OneDrive upload sessions need the total size up front".to_string(),
            ));
        }
        if part_size % FRAGMENT_ALIGNMENT != 0 {
            return Err(Error::InvalidInput(format!(
                "Part size {} is not a multiple of {}",
                part_size, FRAGMENT_ALIGNMENT
            )));
        }
        self.require_parent_folder(path).await?;

        let upload_id = self.client.create_upload_session(path).await?;
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
        let total = upload
            .total_size
            .ok_or_else(|| Error::InvalidInput("Upload has no total size".to_string()))?;

        match self
            .client
            .upload_fragment(&upload.upload_id, part.data.clone(), part.offset, total)
            .await?
        {
            FragmentOutcome::Accepted => Ok(PartReceipt {
                index: part.index,
                token: None,
            }),
            FragmentOutcome::Complete(item) => Ok(PartReceipt {
                index: part.index,
                token: Some(item.id),
            }),
        }
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartReceipt],
    ) -> Result<FileEntry> {
        // The session finalizes itself on the last fragment.
        if parts.last().and_then(|p| p.token.as_ref()).is_none() {
            return Err(Error::Conflict(format!(
                "Upload to {} has not received all bytes",
                upload.path
            )));
        }
        self.stat(&upload.path).await
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<()> {
        self.client.cancel_upload_session(&upload.upload_id).await
    }

    async fn delete(&self, path: &LogicalPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete the root".to_string()));
        }
        let item = self.require_item(path).await?;
        if item.folder.as_ref().is_some_and(|f| f.child_count > 0) {
            return Err(Error::Conflict(format!("Folder is not empty: {}", path)));
        }
        self.client.delete_item(path).await
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

        let source = self.require_item(from).await?;
        let parent = self.require_parent_folder(to).await?;
        let name = to
            .native_name()
            .ok_or_else(|| Error::InvalidInput("Destination has no name".to_string()))?;

        if let Some(existing) = self.client.get_item(to).await? {
            if existing.id == source.id {
                return Ok(Self::to_entry(&source, to.clone()));
            }
            if existing.is_folder() || source.is_folder() || !overwrite {
                return Err(Error::Conflict(format!("Destination exists: {}", to)));
            }
            self.client.delete_item(to).await?;
        }

        let moved = self.client.move_item(from, &parent.id, &name).await?;
        Ok(Self::to_entry(&moved, to.clone()))
    }

    async fn create_folder(&self, path: &LogicalPath) -> Result<FileEntry> {
        self.require_parent_folder(path).await?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput("Root already exists".to_string()))?;
        let name = path
            .native_name()
            .ok_or_else(|| Error::InvalidInput("Path has no name".to_string()))?;

        let folder = self.client.create_folder(&parent, &name).await?;
        Ok(Self::to_entry(&folder, path.clone()))
    }

    async fn share_link(&self, path: &LogicalPath, expires_in: Duration) -> Result<ShareLink> {
        self.require_item(path).await?;
        let expires_in = chrono::Duration::from_std(expires_in)
            .map_err(|e| Error::InvalidInput(format!("Invalid link lifetime: {}", e)))?;
        let (url, expires_at) = self
            .client
            .create_link(path, Utc::now() + expires_in)
            .await?;
        Ok(ShareLink { url, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storegate_common::Credential;

    use crate::onedrive::client::GRAPH_API_BASE;
    use crate::provider::StaticCredentials;

    fn adapter() -> OneDriveAdapter {
        let client = GraphClient::new(
            GRAPH_API_BASE,
            "me",
            Arc::new(StaticCredentials::new(Credential::anonymous())),
        )
        .unwrap();
        OneDriveAdapter::new(client)
    }

    #[test]
    fn test_limits() {
        assert_eq!(LIMITS.max_part_size % FRAGMENT_ALIGNMENT, 0);
        assert!(LIMITS.max_part_size <= 60 * 1024 * 1024);
        let size = LIMITS.negotiate(5 * 1024 * 1024, Some(100 * 1024 * 1024));
        assert_eq!(size % FRAGMENT_ALIGNMENT, 0);
    }

    #[tokio::test]
    async fn test_begin_requires_total_size() {
        let path = LogicalPath::parse("/video.mp4").unwrap();
        let err = adapter()
            .begin_multipart(&path, None, FRAGMENT_ALIGNMENT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_foreign_page_token_is_invalid_cursor() {
        let err = adapter()
            .list(&LogicalPath::root(), Some("https://elsewhere.example/next"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCursor(_)));
    }
}
