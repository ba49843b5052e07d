//! Storage adapter trait definition.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::{Duration, Instant};

use storegate_common::{
    ByteRange, Credential, Error, FileEntry, LogicalPath, ProviderKind, Result,
};

/// Byte stream type for read/write operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Drain a stream into one buffer.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// One page of a folder listing in provider terms.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<FileEntry>,
    /// Provider-native continuation token for the next page.
    pub next_token: Option<String>,
}

/// Options for a simple write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Replace an existing object at the path.
    pub overwrite: bool,
    /// Only write if the existing object's etag matches.
    pub if_match: Option<String>,
}

impl WriteOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            if_match: None,
        }
    }

    pub fn create_new() -> Self {
        Self::default()
    }

    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            overwrite: true,
            if_match: Some(etag.into()),
        }
    }
}

/// Provider-side handle for an in-progress multipart upload.
///
/// Serializable so transfer sessions can resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub path: LogicalPath,
    /// S3 UploadId, Drive session URI or Graph uploadUrl.
    pub upload_id: String,
    pub total_size: Option<u64>,
    pub part_size: u64,
}

/// One part handed to [`StorageAdapter::upload_part`].
#[derive(Debug, Clone)]
pub struct PartUpload {
    /// Zero-based part index.
    pub index: u32,
    /// Byte offset of the part within the object.
    pub offset: u64,
    pub data: Bytes,
    /// Whether this is the final part.
    pub is_last: bool,
}

/// Acknowledgement of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub index: u32,
    /// Native part token: S3 part ETag, or the created item id when a
    /// sequential provider finished the upload on this part.
    #[serde(default)]
    pub token: Option<String>,
}

/// Multipart constraints of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// Minimum size of every part except the last.
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
    /// Part sizes must be a multiple of this.
    pub alignment: u64,
    /// Parts can be uploaded in any order.
    pub independent_parts: bool,
    /// Largest payload a simple (single request) write accepts.
    pub simple_upload_limit: u64,
}

impl PartLimits {
    /// Pick a part size honouring the provider's constraints.
    ///
    /// Starts from the requested size, raises it to the minimum, grows it until
    /// a known total fits in `max_parts`, then rounds up to the alignment.
    pub fn negotiate(&self, requested: u64, total_size: Option<u64>) -> u64 {
        let mut size = requested.max(self.min_part_size).max(1);

        if let Some(total) = total_size {
            let max_parts = u64::from(self.max_parts.max(1));
            let needed = total.div_ceil(max_parts);
            size = size.max(needed);
        }

        let alignment = self.alignment.max(1);
        size = size.div_ceil(alignment) * alignment;
        size.min(self.max_part_size.max(self.min_part_size))
    }

    /// Number of parts a known total splits into (at least one).
    pub fn part_count(total_size: u64, part_size: u64) -> u32 {
        let parts = total_size.div_ceil(part_size.max(1)).max(1);
        u32::try_from(parts).unwrap_or(u32::MAX)
    }
}

/// Known request budget of a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateQuota {
    /// Sustained requests per second.
    pub per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Most recent throttle instruction seen from the provider.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSignal {
    pub retry_after: Duration,
    pub observed_at: Instant,
}

impl RateLimitSignal {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            retry_after,
            observed_at: Instant::now(),
        }
    }

    /// Remaining wait, or `None` once the signal has elapsed.
    pub fn remaining(&self) -> Option<Duration> {
        self.retry_after
            .checked_sub(self.observed_at.elapsed())
            .filter(|d| !d.is_zero())
    }
}

/// A shareable link to an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLink {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Supplies credentials to an adapter.
///
/// Adapters never cache secrets themselves; they ask on every request so a
/// refresh or revocation takes effect immediately.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current, unexpired credential.
    async fn credential(&self) -> Result<Credential>;

    /// Called when the provider rejected `rejected`; returns a fresh credential.
    async fn refresh_after_rejection(&self, rejected: &Credential) -> Result<Credential>;
}

/// Credential source with a fixed credential, for tests and static keys.
pub struct StaticCredentials(Credential);

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.0.clone())
    }

    async fn refresh_after_rejection(&self, _rejected: &Credential) -> Result<Credential> {
        Err(Error::Authentication(
            "Static credential rejected by provider".to_string(),
        ))
    }
}

/// Capability set every storage backend implements.
///
/// All operations are async. Errors are already classified into the common
/// taxonomy; transient failures are never retried here.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend family.
    fn kind(&self) -> ProviderKind;

    /// Multipart constraints.
    fn part_limits(&self) -> PartLimits;

    /// Known request budget, used to size the admission bucket.
    fn rate_quota(&self) -> Option<RateQuota>;

    /// Latest throttle instruction parsed from a provider response.
    fn rate_limit_signal(&self) -> Option<RateLimitSignal>;

    /// List one page of a folder.
    ///
    /// # Errors
    /// - `NotFound` if the folder does not exist
    /// - `InvalidCursor` if `page_token` expired or was rejected
    async fn list(
        &self,
        path: &LogicalPath,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage>;

    /// Get metadata for a path.
    async fn stat(&self, path: &LogicalPath) -> Result<FileEntry>;

    /// Read a file, optionally limited to a byte range.
    async fn read(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream>;

    /// Write a complete object in one request.
    ///
    /// # Errors
    /// - `Conflict` if the object exists and `overwrite` is off, or `if_match` differs
    async fn write(&self, path: &LogicalPath, data: Bytes, options: &WriteOptions)
        -> Result<FileEntry>;

    /// Start a multipart upload with an already negotiated part size.
    async fn begin_multipart(
        &self,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Result<MultipartUpload>;

    /// Upload one part.
    async fn upload_part(&self, upload: &MultipartUpload, part: &PartUpload)
        -> Result<PartReceipt>;

    /// Finish a multipart upload; `parts` are ordered by index.
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartReceipt],
    ) -> Result<FileEntry>;

    /// Abandon a multipart upload. Unknown uploads are not an error.
    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<()>;

    /// Delete a file or an empty folder.
    ///
    /// # Errors
    /// - `Conflict` if the folder is not empty
    async fn delete(&self, path: &LogicalPath) -> Result<()>;

    /// Move/rename a path.
    ///
    /// # Errors
    /// - `Conflict` if the destination exists and `overwrite` is off
    async fn rename(&self, from: &LogicalPath, to: &LogicalPath, overwrite: bool)
        -> Result<FileEntry>;

    /// Create a folder. The parent must exist.
    async fn create_folder(&self, path: &LogicalPath) -> Result<FileEntry>;

    /// Create a link that grants read access to the entry.
    async fn share_link(&self, path: &LogicalPath, expires_in: Duration) -> Result<ShareLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_like() -> PartLimits {
        PartLimits {
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
            alignment: 1,
            independent_parts: true,
            simple_upload_limit: 5 * 1024 * 1024 * 1024,
        }
    }

    #[test]
    fn test_negotiate_raises_to_minimum() {
        let limits = s3_like();
        assert_eq!(limits.negotiate(1024, Some(10 * 1024 * 1024)), 5 * 1024 * 1024);
    }

    #[test]
    fn test_negotiate_grows_to_fit_max_parts() {
        let limits = s3_like();
        let total = 100 * 1024 * 1024 * 1024u64;
        let size = limits.negotiate(8 * 1024 * 1024, Some(total));
        assert!(PartLimits::part_count(total, size) <= 10_000);
    }

    #[test]
    fn test_negotiate_rounds_to_alignment() {
        let limits = PartLimits {
            min_part_size: 320 * 1024,
            max_part_size: 60 * 1024 * 1024,
            max_parts: 100_000,
            alignment: 320 * 1024,
            independent_parts: false,
            simple_upload_limit: 4 * 1024 * 1024,
        };
        let size = limits.negotiate(1_000_000, None);
        assert_eq!(size % (320 * 1024), 0);
        assert!(size >= 1_000_000);
    }

    #[test]
    fn test_part_count() {
        assert_eq!(PartLimits::part_count(10, 4), 3);
        assert_eq!(PartLimits::part_count(8, 4), 2);
        assert_eq!(PartLimits::part_count(0, 4), 1);
    }

    #[test]
    fn test_rate_limit_signal_elapses() {
        let signal = RateLimitSignal {
            retry_after: Duration::from_millis(1),
            observed_at: Instant::now() - Duration::from_secs(1),
        };
        assert!(signal.remaining().is_none());
        assert!(RateLimitSignal::new(Duration::from_secs(30)).remaining().is_some());
    }

    #[tokio::test]
    async fn test_collect_stream() {
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let stream: ByteStream = Box::pin(stream::iter(chunks));
        let data = collect_stream(stream).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_static_credentials_cannot_refresh() {
        let creds = StaticCredentials::new(Credential::anonymous());
        let current = creds.credential().await.unwrap();
        assert!(creds.refresh_after_rejection(&current).await.is_err());
    }
}
