//! S3-compatible storage adapter implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use std::time::Duration;

use storegate_common::{ByteRange, Error, FileEntry, LogicalPath, ProviderKind, Result};

use super::client::{Precondition, S3Client};
use super::sigv4::MAX_PRESIGN_EXPIRY;
use crate::provider::{
    stream_from_bytes, ByteStream, ListPage, MultipartUpload, PartLimits, PartReceipt,
    PartUpload, RateLimitSignal, RateQuota, ShareLink, StorageAdapter, WriteOptions,
};

const MIB: u64 = 1024 * 1024;

/// Keys listed per request when walking a folder for copy or emptiness checks.
const WALK_PAGE_SIZE: u32 = 1000;

/// S3-compatible storage adapter.
pub struct S3Adapter {
    client: S3Client,
}

impl S3Adapter {
    pub const LIMITS: PartLimits = PartLimits {
        min_part_size: 5 * MIB,
        max_part_size: 5 * 1024 * MIB,
        max_parts: 10_000,
        alignment: 1,
        independent_parts: true,
        simple_upload_limit: 5 * 1024 * MIB,
    };

    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    fn root_entry(&self) -> FileEntry {
        FileEntry::folder(self.client.bucket(), LogicalPath::root(), Utc::now())
    }

    /// Every key under a folder prefix, following continuation tokens.
    async fn walk_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(prefix, None, token.as_deref(), WALK_PAGE_SIZE)
                .await?;
            keys.extend(page.contents.into_iter().map(|o| o.key));
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(keys)
    }

    /// Whether anything (marker or children) exists under a folder prefix.
    async fn folder_exists(&self, prefix: &str) -> Result<bool> {
        let page = self.client.list_objects(prefix, Some("/"), None, 1).await?;
        Ok(!page.contents.is_empty() || !page.common_prefixes.is_empty())
    }
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::S3Compatible
    }

    fn part_limits(&self) -> PartLimits {
        Self::LIMITS
    }

    fn rate_quota(&self) -> Option<RateQuota> {
        // Per-prefix PUT budget documented by AWS.
        Some(RateQuota {
            per_second: 3500.0,
            burst: 3500,
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
        let prefix = self.client.folder_key(path);
        let result = self
            .client
            .list_objects(&prefix, Some("/"), page_token, page_size)
            .await
            .map_err(|e| match (e, page_token) {
                (Error::InvalidInput(msg), Some(_)) => Error::InvalidCursor(msg),
                (e, _) => e,
            })?;

        let is_empty = result.contents.is_empty() && result.common_prefixes.is_empty();
        if is_empty && page_token.is_none() && !path.is_root() {
            return Err(Error::NotFound(format!("Folder not found: {}", path)));
        }

        let mut entries = Vec::with_capacity(result.contents.len() + result.common_prefixes.len());
        for common in result.common_prefixes {
            let child = match self.client.path_for_key(&common.prefix) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(prefix = %common.prefix, "Skipping unlistable prefix: {}", e);
                    continue;
                }
            };
            entries.push(
                FileEntry::folder(common.prefix.clone(), child, Utc::now()).with_marker(common.prefix),
            );
        }
        for object in result.contents {
            // The folder's own marker object.
            if object.key == prefix {
                continue;
            }
            let child = match self.client.path_for_key(&object.key) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(key = %object.key, "Skipping unlistable key: {}", e);
                    continue;
                }
            };
            entries.push(
                FileEntry::file(
                    object.key.clone(),
                    child,
                    object.size,
                    object.last_modified.unwrap_or_else(Utc::now),
                    object.etag,
                )
                .with_marker(object.key),
            );
        }
        entries.sort_by(|a, b| a.marker.cmp(&b.marker));

        let next_token = if result.is_truncated {
            result.next_continuation_token
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn stat(&self, path: &LogicalPath) -> Result<FileEntry> {
        if path.is_root() {
            return Ok(self.root_entry());
        }

        let key = self.client.object_key(path);
        if let Some(head) = self.client.head_object(&key).await? {
            return Ok(FileEntry::file(
                key,
                path.clone(),
                head.size,
                head.last_modified,
                head.etag,
            ));
        }

        let prefix = self.client.folder_key(path);
        if self.folder_exists(&prefix).await? {
            return Ok(FileEntry::folder(prefix, path.clone(), Utc::now()));
        }
        Err(Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn read(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream> {
        let key = self.client.object_key(path);
        match self.client.get_object(&key, range).await? {
            Some(response) => {
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| Error::Network(format!("Stream read error: {}", e))));
                Ok(Box::pin(stream))
            }
            None => Ok(stream_from_bytes(Bytes::new())),
        }
    }

    async fn write(
        &self,
        path: &LogicalPath,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to root".to_string()));
        }
        let precondition = match (&options.if_match, options.overwrite) {
            (Some(etag), _) => Precondition::IfMatch(etag.clone()),
            (None, true) => Precondition::None,
            (None, false) => Precondition::IfAbsent,
        };

        let key = self.client.object_key(path);
        let size = data.len() as u64;
        let etag = self.client.put_object(&key, data, &precondition).await?;
        tracing::debug!(key = %key, size, "Uploaded object");

        Ok(FileEntry::file(key, path.clone(), size, Utc::now(), etag))
    }

    async fn begin_multipart(
        &self,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Result<MultipartUpload> {
        let key = self.client.object_key(path);
        let upload_id = self.client.create_multipart_upload(&key).await?;
        tracing::debug!(key = %key, upload_id = %upload_id, "Initiated multipart upload");

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
        let key = self.client.object_key(&upload.path);
        let etag = self
            .client
            .upload_part(&key, &upload.upload_id, part.index + 1, part.data.clone())
            .await?;

        Ok(PartReceipt {
            index: part.index,
            token: Some(etag),
        })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartReceipt],
    ) -> Result<FileEntry> {
        let numbered = parts
            .iter()
            .map(|p| {
                p.token
                    .clone()
                    .map(|etag| (p.index + 1, etag))
                    .ok_or_else(|| Error::InvalidInput(format!("Part {} has no ETag", p.index)))
            })
            .collect::<Result<Vec<_>>>()?;

        let key = self.client.object_key(&upload.path);
        let etag = self
            .client
            .complete_multipart_upload(&key, &upload.upload_id, &numbered)
            .await?;

        match self.client.head_object(&key).await? {
            Some(head) => Ok(FileEntry::file(
                key,
                upload.path.clone(),
                head.size,
                head.last_modified,
                head.etag.or(etag),
            )),
            None => Ok(FileEntry::file(
                key,
                upload.path.clone(),
                upload.total_size.unwrap_or(0),
                Utc::now(),
                etag,
            )),
        }
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<()> {
        let key = self.client.object_key(&upload.path);
        self.client
            .abort_multipart_upload(&key, &upload.upload_id)
            .await
    }

    async fn delete(&self, path: &LogicalPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete root".to_string()));
        }

        let key = self.client.object_key(path);
        if self.client.head_object(&key).await?.is_some() {
            return self.client.delete_object(&key).await;
        }

        let prefix = self.client.folder_key(path);
        let page = self.client.list_objects(&prefix, Some("/"), None, 2).await?;
        let has_children = !page.common_prefixes.is_empty()
            || page.contents.iter().any(|o| o.key != prefix);
        let has_marker = page.contents.iter().any(|o| o.key == prefix);

        if has_children {
            return Err(Error::Conflict(format!("Folder not empty: {}", path)));
        }
        if !has_marker {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }
        self.client.delete_object(&prefix).await
    }

    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        overwrite: bool,
    ) -> Result<FileEntry> {
        if from.is_root() || to.is_root() {
            return Err(Error::InvalidInput("Cannot move the root folder".to_string()));
        }
        if from.contains(to) {
            return Err(Error::InvalidInput(format!("Cannot move {} into itself", from)));
        }

        let source = self.stat(from).await?;
        match self.stat(to).await {
            Ok(existing) if existing.is_folder() || source.is_folder() || !overwrite => {
                return Err(Error::Conflict(format!("Destination already exists: {}", to)));
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !source.is_folder() {
            let from_key = self.client.object_key(from);
            let to_key = self.client.object_key(to);
            self.client.copy_object(&from_key, &to_key).await?;
            self.client.delete_object(&from_key).await?;
            return self.stat(to).await;
        }

        // No native folder rename: copy every key under the prefix, then delete.
        let from_prefix = self.client.folder_key(from);
        let to_prefix = self.client.folder_key(to);
        let keys = self.walk_keys(&from_prefix).await?;
        for key in &keys {
            let dest = format!("{}{}", to_prefix, &key[from_prefix.len()..]);
            self.client.copy_object(key, &dest).await?;
        }
        for key in &keys {
            self.client.delete_object(key).await?;
        }
        tracing::debug!(from = %from, to = %to, objects = keys.len(), "Moved folder");

        Ok(FileEntry::folder(to_prefix, to.clone(), Utc::now()))
    }

    async fn create_folder(&self, path: &LogicalPath) -> Result<FileEntry> {
        match self.stat(path).await {
            Ok(_) => return Err(Error::Conflict(format!("Path already exists: {}", path))),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(parent) = path.parent() {
            if !self.stat(&parent).await?.is_folder() {
                return Err(Error::Conflict(format!("Not a folder: {}", parent)));
            }
        }

        let marker = self.client.folder_key(path);
        self.client
            .put_object(&marker, Bytes::new(), &Precondition::IfAbsent)
            .await?;
        Ok(FileEntry::folder(marker, path.clone(), Utc::now()))
    }

    async fn share_link(&self, path: &LogicalPath, expires_in: Duration) -> Result<ShareLink> {
        let entry = self.stat(path).await?;
        if entry.is_folder() {
            return Err(Error::InvalidInput(format!(
                "S3 cannot share folders: {}",
                path
            )));
        }

        let expires_in = expires_in.min(MAX_PRESIGN_EXPIRY);
        let url = self.client.presign_get(&entry.native_id, expires_in).await?;
        let expires_at = ChronoDuration::from_std(expires_in)
            .ok()
            .map(|d| Utc::now() + d);

        Ok(ShareLink {
            url: url.to_string(),
            expires_at,
        })
    }
}
