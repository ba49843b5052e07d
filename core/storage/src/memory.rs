//! In-memory storage adapter for testing.
//!
//! Besides storing data it can inject faults and latency per operation and
//! counts calls, so gateway behaviour under provider failure can be tested
//! without a network.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use storegate_common::{ByteRange, Error, FileEntry, LogicalPath, ProviderKind, Result};

use crate::http::RateSignalCell;
use crate::provider::{
    stream_from_bytes, ByteStream, ListPage, MultipartUpload, PartLimits, PartReceipt,
    PartUpload, RateLimitSignal, RateQuota, ShareLink, StorageAdapter, WriteOptions,
};

/// Adapter operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Stat,
    Read,
    Write,
    BeginMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
    Delete,
    Rename,
    CreateFolder,
    ShareLink,
}

/// A failure to inject into the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Throttled(Option<Duration>),
    Network,
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    Conflict,
}

impl Fault {
    fn into_error(self, op: Operation) -> Error {
        let message = format!("injected fault in {:?}", op);
        match self {
            Fault::Unavailable => Error::Unavailable(message),
            Fault::Throttled(retry_after) => Error::Throttled {
                message,
                retry_after,
            },
            Fault::Network => Error::Network(message),
            Fault::NotFound => Error::NotFound(message),
            Fault::PermissionDenied => Error::PermissionDenied(message),
            Fault::QuotaExceeded => Error::QuotaExceeded(message),
            Fault::Conflict => Error::Conflict(message),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File {
        native_id: String,
        data: Bytes,
        etag: String,
        modified: DateTime<Utc>,
    },
    Folder {
        native_id: String,
        modified: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct PendingUpload {
    parts: BTreeMap<u32, Bytes>,
    /// Bytes received so far, for sequential offset checks.
    received: u64,
}

#[derive(Debug)]
struct State {
    /// Keyed by relative path ("" is the root folder).
    nodes: BTreeMap<String, Node>,
    uploads: HashMap<String, PendingUpload>,
    /// Page tokens from an older generation are rejected.
    token_generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_of(path: &LogicalPath) -> String {
    path.relative()
}

fn child_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

/// In-memory storage adapter.
///
/// All data is stored in memory and lost on drop.
pub struct MemoryAdapter {
    state: RwLock<State>,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    calls: Mutex<HashMap<Operation, u64>>,
    latency: Mutex<Duration>,
    limits: PartLimits,
    quota: Option<RateQuota>,
    signal: RateSignalCell,
}

impl MemoryAdapter {
    /// Default multipart limits: any part size, parts in any order.
    pub const DEFAULT_LIMITS: PartLimits = PartLimits {
        min_part_size: 1,
        max_part_size: 64 * 1024 * 1024,
        max_parts: 10_000,
        alignment: 1,
        independent_parts: true,
        simple_upload_limit: 8 * 1024 * 1024,
    };

    /// Create a new adapter holding only the root folder.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::Folder {
                native_id: Uuid::new_v4().to_string(),
                modified: Utc::now(),
            },
        );

        Self {
            state: RwLock::new(State {
                nodes,
                uploads: HashMap::new(),
                token_generation: 0,
            }),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            limits: Self::DEFAULT_LIMITS,
            quota: None,
            signal: RateSignalCell::new(),
        }
    }

    /// Override the multipart limits, e.g. to behave like a sequential provider.
    pub fn with_limits(mut self, limits: PartLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Advertise a request budget.
    pub fn with_quota(mut self, quota: RateQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Fail the next calls of `op`, one fault per call, in order.
    pub fn fail_next(&self, op: Operation, faults: impl IntoIterator<Item = Fault>) {
        lock(&self.faults).entry(op).or_default().extend(faults);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Number of calls made to `op`, including faulted ones.
    pub fn calls(&self, op: Operation) -> u64 {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Invalidate every page token handed out so far.
    pub fn expire_page_tokens(&self) {
        self.write_state().token_generation += 1;
    }

    /// Number of multipart uploads that are neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.read_state().uploads.len()
    }

    /// Store a file directly, creating missing parent folders.
    pub fn seed_file(&self, path: &LogicalPath, data: impl Into<Bytes>) {
        let mut state = self.write_state();
        let mut folder = LogicalPath::root();
        for component in path.components().iter().take(path.components().len().saturating_sub(1)) {
            if let Ok(next) = folder.join(component) {
                folder = next;
            }
            state
                .nodes
                .entry(key_of(&folder))
                .or_insert_with(|| Node::Folder {
                    native_id: Uuid::new_v4().to_string(),
                    modified: Utc::now(),
                });
        }
        state.nodes.insert(key_of(path), new_file(data.into()));
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply latency and pop an injected fault.
    async fn enter(&self, op: Operation) -> Result<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = lock(&self.faults).get_mut(&op).and_then(|q| q.pop_front());
        if let Some(fault) = fault {
            let err = fault.into_error(op);
            self.signal.observe(&err);
            tracing::debug!(?op, error = %err, "Injecting fault");
            return Err(err);
        }
        Ok(())
    }

    fn require_folder(state: &State, path: &LogicalPath) -> Result<()> {
        match state.nodes.get(&key_of(path)) {
            Some(Node::Folder { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(Error::Conflict(format!("Not a folder: {}", path))),
            None => Err(Error::NotFound(format!("Folder not found: {}", path))),
        }
    }

    fn require_parent(state: &State, path: &LogicalPath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput("Root has no parent".to_string()))?;
        Self::require_folder(state, &parent)
    }

    fn has_children(state: &State, key: &str) -> bool {
        let prefix = child_prefix(key);
        state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k != key)
    }

    fn to_entry(key: &str, node: &Node) -> Result<FileEntry> {
        let path = LogicalPath::parse(key)?;
        Ok(match node {
            Node::File {
                native_id,
                data,
                etag,
                modified,
            } => FileEntry::file(
                native_id.clone(),
                path,
                data.len() as u64,
                *modified,
                Some(etag.clone()),
            ),
            Node::Folder {
                native_id,
                modified,
            } => FileEntry::folder(native_id.clone(), path, *modified),
        })
    }

    fn put_file(
        &self,
        path: &LogicalPath,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to root".to_string()));
        }
        let key = key_of(path);
        let mut state = self.write_state();
        Self::require_parent(&state, path)?;

        match state.nodes.get(&key) {
            Some(Node::Folder { .. }) => {
                return Err(Error::Conflict(format!("A folder exists at {}", path)));
            }
            Some(Node::File { etag, .. }) => {
                if let Some(expected) = &options.if_match {
                    if expected != etag {
                        return Err(Error::Conflict(format!("ETag mismatch for {}", path)));
                    }
                } else if !options.overwrite {
                    return Err(Error::Conflict(format!("File already exists: {}", path)));
                }
            }
            None => {
                if options.if_match.is_some() {
                    return Err(Error::Conflict(format!(
                        "Precondition failed, no file at {}",
                        path
                    )));
                }
            }
        }

        let node = new_file(data);
        let entry = Self::to_entry(&key, &node)?;
        state.nodes.insert(key, node);
        Ok(entry)
    }
}

fn new_file(data: Bytes) -> Node {
    Node::File {
        native_id: Uuid::new_v4().to_string(),
        data,
        etag: Uuid::new_v4().simple().to_string(),
        modified: Utc::now(),
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    fn part_limits(&self) -> PartLimits {
        self.limits
    }

    fn rate_quota(&self) -> Option<RateQuota> {
        self.quota
    }

    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        self.signal.current()
    }

    async fn list(
        &self,
        path: &LogicalPath,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage> {
        self.enter(Operation::List).await?;
        let state = self.read_state();
        Self::require_folder(&state, path)?;

        let start_after = match page_token {
            Some(token) => {
                let (generation, last_key) = token
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidCursor("Malformed page token".to_string()))?;
                let generation: u64 = generation
                    .parse()
                    .map_err(|_| Error::InvalidCursor("Malformed page token".to_string()))?;
                if generation != state.token_generation {
                    return Err(Error::InvalidCursor("Page token expired".to_string()));
                }
                Some(last_key.to_string())
            }
            None => None,
        };

        let key = key_of(path);
        let prefix = child_prefix(&key);
        let page_size = page_size.max(1) as usize;

        let mut children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| **k != key && !k[prefix.len()..].contains('/'))
            .filter(|(k, _)| start_after.as_deref().is_none_or(|after| k.as_str() > after));

        let mut entries = Vec::with_capacity(page_size);
        for (child_key, node) in children.by_ref().take(page_size) {
            entries.push(Self::to_entry(child_key, node)?.with_marker(child_key.clone()));
        }

        let next_token = match (children.next(), entries.last()) {
            (Some(_), Some(last)) => last
                .marker
                .as_ref()
                .map(|m| format!("{}:{}", state.token_generation, m)),
            _ => None,
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn stat(&self, path: &LogicalPath) -> Result<FileEntry> {
        self.enter(Operation::Stat).await?;
        let key = key_of(path);
        let state = self.read_state();
        let node = state
            .nodes
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))?;
        Self::to_entry(&key, node)
    }

    async fn read(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream> {
        self.enter(Operation::Read).await?;
        let data = {
            let state = self.read_state();
            match state.nodes.get(&key_of(path)) {
                Some(Node::File { data, .. }) => data.clone(),
                Some(Node::Folder { .. }) => {
                    return Err(Error::InvalidInput(format!("Cannot read folder: {}", path)));
                }
                None => return Err(Error::NotFound(format!("File not found: {}", path))),
            }
        };

        let data = match range {
            Some(range) => {
                let (start, end) = range.clamp(data.len() as u64);
                data.slice(start as usize..end as usize)
            }
            None => data,
        };
        Ok(stream_from_bytes(data))
    }

    async fn write(
        &self,
        path: &LogicalPath,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<FileEntry> {
        self.enter(Operation::Write).await?;
        self.put_file(path, data, options)
    }

    async fn begin_multipart(
        &self,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Result<MultipartUpload> {
        self.enter(Operation::BeginMultipart).await?;
        let mut state = self.write_state();
        Self::require_parent(&state, path)?;

        let upload_id = Uuid::new_v4().to_string();
        state
            .uploads
            .insert(upload_id.clone(), PendingUpload::default());

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
        self.enter(Operation::UploadPart).await?;
        let mut state = self.write_state();
        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| Error::NotFound(format!("Upload not found: {}", upload.upload_id)))?;

        if !self.limits.independent_parts {
            if part.offset != pending.received {
                return Err(Error::Conflict(format!(
                    "Expected offset {}, got {}",
                    pending.received, part.offset
                )));
            }
            pending.received += part.data.len() as u64;
        }

        pending.parts.insert(part.index, part.data.clone());
        Ok(PartReceipt {
            index: part.index,
            token: Some(format!("part-{}-{}", part.index, part.data.len())),
        })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartReceipt],
    ) -> Result<FileEntry> {
        self.enter(Operation::CompleteMultipart).await?;
        let mut state = self.write_state();
        let pending = state
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| Error::NotFound(format!("Upload not found: {}", upload.upload_id)))?;

        let mut data = BytesMut::new();
        for receipt in parts {
            let part = pending.parts.get(&receipt.index).ok_or_else(|| {
                Error::InvalidInput(format!("Part {} was never uploaded", receipt.index))
            })?;
            data.extend_from_slice(part);
        }

        if let Some(total) = upload.total_size {
            if data.len() as u64 != total {
                return Err(Error::InvalidInput(format!(
                    "Assembled {} bytes, expected {}",
                    data.len(),
                    total
                )));
            }
        }

        state.uploads.remove(&upload.upload_id);
        drop(state);
        self.put_file(&upload.path, data.freeze(), &WriteOptions::overwrite())
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> Result<()> {
        self.enter(Operation::AbortMultipart).await?;
        self.write_state().uploads.remove(&upload.upload_id);
        Ok(())
    }

    async fn delete(&self, path: &LogicalPath) -> Result<()> {
        self.enter(Operation::Delete).await?;
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot delete root".to_string()));
        }
        let key = key_of(path);
        let mut state = self.write_state();

        match state.nodes.get(&key) {
            Some(Node::Folder { .. }) if Self::has_children(&state, &key) => {
                Err(Error::Conflict(format!("Folder not empty: {}", path)))
            }
            Some(_) => {
                state.nodes.remove(&key);
                Ok(())
            }
            None => Err(Error::NotFound(format!("Path not found: {}", path))),
        }
    }

    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        overwrite: bool,
    ) -> Result<FileEntry> {
        self.enter(Operation::Rename).await?;
        if from.is_root() || to.is_root() {
            return Err(Error::InvalidInput("Cannot move the root folder".to_string()));
        }
        if from.contains(to) {
            return Err(Error::InvalidInput(format!(
                "Cannot move {} into itself",
                from
            )));
        }

        let from_key = key_of(from);
        let to_key = key_of(to);
        let mut state = self.write_state();

        let source = state
            .nodes
            .get(&from_key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", from)))?;
        Self::require_parent(&state, to)?;

        match state.nodes.get(&to_key) {
            Some(Node::Folder { .. }) => {
                return Err(Error::Conflict(format!("Destination is a folder: {}", to)));
            }
            Some(Node::File { .. }) if !overwrite || matches!(source, Node::Folder { .. }) => {
                return Err(Error::Conflict(format!("Destination already exists: {}", to)));
            }
            _ => {}
        }

        let from_prefix = child_prefix(&from_key);
        let descendants: Vec<String> = state
            .nodes
            .range(from_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&from_prefix))
            .map(|(k, _)| k.clone())
            .collect();

        state.nodes.remove(&from_key);
        state.nodes.insert(to_key.clone(), source);
        for old_key in descendants {
            if let Some(node) = state.nodes.remove(&old_key) {
                let new_key = format!("{}/{}", to_key, &old_key[from_prefix.len()..]);
                state.nodes.insert(new_key, node);
            }
        }

        let node = state
            .nodes
            .get(&to_key)
            .ok_or_else(|| Error::Unknown(format!("Moved entry vanished: {}", to)))?;
        Self::to_entry(&to_key, node)
    }

    async fn create_folder(&self, path: &LogicalPath) -> Result<FileEntry> {
        self.enter(Operation::CreateFolder).await?;
        let key = key_of(path);
        let mut state = self.write_state();

        if state.nodes.contains_key(&key) {
            return Err(Error::Conflict(format!("Path already exists: {}", path)));
        }
        Self::require_parent(&state, path)?;

        let node = Node::Folder {
            native_id: Uuid::new_v4().to_string(),
            modified: Utc::now(),
        };
        let entry = Self::to_entry(&key, &node)?;
        state.nodes.insert(key, node);
        Ok(entry)
    }

    async fn share_link(&self, path: &LogicalPath, expires_in: Duration) -> Result<ShareLink> {
        self.enter(Operation::ShareLink).await?;
        let state = self.read_state();
        let native_id = match state.nodes.get(&key_of(path)) {
            Some(Node::File { native_id, .. }) | Some(Node::Folder { native_id, .. }) => {
                native_id.clone()
            }
            None => return Err(Error::NotFound(format!("Path not found: {}", path))),
        };

        let expires_at = Utc::now()
            + ChronoDuration::from_std(expires_in).unwrap_or_else(|_| ChronoDuration::days(7));
        Ok(ShareLink {
            url: format!("memory://{}?expires={}", native_id, expires_at.timestamp()),
            expires_at: Some(expires_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::collect_stream;

    fn p(s: &str) -> LogicalPath {
        LogicalPath::parse(s).unwrap()
    }

    async fn read_all(adapter: &MemoryAdapter, path: &str) -> Bytes {
        collect_stream(adapter.read(&p(path), None).await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_read() {
        let adapter = MemoryAdapter::new();
        let data = Bytes::from_static(b"Hello, World!");

        let entry = adapter
            .write(&p("/test.txt"), data.clone(), &WriteOptions::create_new())
            .await
            .unwrap();

        assert_eq!(entry.size, Some(13));
        assert_eq!(read_all(&adapter, "/test.txt").await, data);
    }

    #[tokio::test]
    async fn test_ranged_read() {
        let adapter = MemoryAdapter::new();
        adapter.seed_file(&p("/a.bin"), Bytes::from_static(b"0123456789"));

        let stream = adapter
            .read(&p("/a.bin"), Some(ByteRange::new(2, Some(3))))
            .await
            .unwrap();
        assert_eq!(&collect_stream(stream).await.unwrap()[..], b"234");
    }

    #[tokio::test]
    async fn test_write_without_overwrite_conflicts() {
        let adapter = MemoryAdapter::new();
        let path = p("/a.txt");
        adapter
            .write(&path, Bytes::from_static(b"1"), &WriteOptions::create_new())
            .await
            .unwrap();

        let err = adapter
            .write(&path, Bytes::from_static(b"2"), &WriteOptions::create_new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_if_match() {
        let adapter = MemoryAdapter::new();
        let path = p("/a.txt");
        let entry = adapter
            .write(&path, Bytes::from_static(b"1"), &WriteOptions::create_new())
            .await
            .unwrap();

        let err = adapter
            .write(&path, Bytes::from_static(b"2"), &WriteOptions::if_match("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let etag = entry.etag.unwrap();
        adapter
            .write(&path, Bytes::from_static(b"3"), &WriteOptions::if_match(etag))
            .await
            .unwrap();
        assert_eq!(&read_all(&adapter, "/a.txt").await[..], b"3");
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let adapter = MemoryAdapter::new();
        let err = adapter
            .write(&p("/missing/a.txt"), Bytes::new(), &WriteOptions::overwrite())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_pages() {
        let adapter = MemoryAdapter::new();
        adapter.create_folder(&p("/dir")).await.unwrap();
        for i in 0..5 {
            adapter.seed_file(&p(&format!("/dir/f{}.txt", i)), Bytes::from_static(b"x"));
        }
        adapter.seed_file(&p("/dir/sub/nested.txt"), Bytes::from_static(b"x"));

        let first = adapter.list(&p("/dir"), None, 4).await.unwrap();
        assert_eq!(first.entries.len(), 4);
        let token = first.next_token.expect("more pages");

        let second = adapter.list(&p("/dir"), Some(&token), 4).await.unwrap();
        assert_eq!(second.entries.len(), 2);
        assert!(second.next_token.is_none());

        let names: Vec<_> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .map(|e| e.name.clone())
            .collect();
        assert!(names.contains(&"sub".to_string()));
        assert!(!names.contains(&"nested.txt".to_string()));
    }

    #[tokio::test]
    async fn test_expired_page_token_is_invalid_cursor() {
        let adapter = MemoryAdapter::new();
        for i in 0..3 {
            adapter.seed_file(&p(&format!("/f{}", i)), Bytes::from_static(b"x"));
        }
        let page = adapter.list(&LogicalPath::root(), None, 1).await.unwrap();
        let token = page.next_token.unwrap();

        adapter.expire_page_tokens();
        let err = adapter
            .list(&LogicalPath::root(), Some(&token), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn test_delete_non_empty_folder_conflicts() {
        let adapter = MemoryAdapter::new();
        adapter.seed_file(&p("/dir/a.txt"), Bytes::from_static(b"x"));

        let err = adapter.delete(&p("/dir")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        adapter.delete(&p("/dir/a.txt")).await.unwrap();
        adapter.delete(&p("/dir")).await.unwrap();
        assert!(matches!(
            adapter.stat(&p("/dir")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let adapter = MemoryAdapter::new();
        adapter.seed_file(&p("/old/a/b.txt"), Bytes::from_static(b"x"));

        let entry = adapter
            .rename(&p("/old"), &p("/new"), false)
            .await
            .unwrap();
        assert!(entry.is_folder());
        assert_eq!(&read_all(&adapter, "/new/a/b.txt").await[..], b"x");
        assert!(adapter.stat(&p("/old/a/b.txt")).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_respects_overwrite() {
        let adapter = MemoryAdapter::new();
        adapter.seed_file(&p("/a"), Bytes::from_static(b"a"));
        adapter.seed_file(&p("/b"), Bytes::from_static(b"b"));

        assert!(matches!(
            adapter.rename(&p("/a"), &p("/b"), false).await,
            Err(Error::Conflict(_))
        ));
        adapter.rename(&p("/a"), &p("/b"), true).await.unwrap();
        assert_eq!(&read_all(&adapter, "/b").await[..], b"a");
    }

    #[tokio::test]
    async fn test_multipart_out_of_order() {
        let adapter = MemoryAdapter::new();
        let upload = adapter
            .begin_multipart(&p("/big.bin"), Some(6), 3)
            .await
            .unwrap();

        let second = PartUpload {
            index: 1,
            offset: 3,
            data: Bytes::from_static(b"def"),
            is_last: true,
        };
        let first = PartUpload {
            index: 0,
            offset: 0,
            data: Bytes::from_static(b"abc"),
            is_last: false,
        };
        let r1 = adapter.upload_part(&upload, &second).await.unwrap();
        let r0 = adapter.upload_part(&upload, &first).await.unwrap();

        let entry = adapter.complete_multipart(&upload, &[r0, r1]).await.unwrap();
        assert_eq!(entry.size, Some(6));
        assert_eq!(&read_all(&adapter, "/big.bin").await[..], b"abcdef");
        assert_eq!(adapter.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_sequential_limits_reject_gaps() {
        let adapter = MemoryAdapter::new().with_limits(PartLimits {
            independent_parts: false,
            ..MemoryAdapter::DEFAULT_LIMITS
        });
        let upload = adapter.begin_multipart(&p("/s.bin"), None, 2).await.unwrap();

        let skipped = PartUpload {
            index: 1,
            offset: 2,
            data: Bytes::from_static(b"cd"),
            is_last: true,
        };
        assert!(matches!(
            adapter.upload_part(&upload, &skipped).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection_and_counters() {
        let adapter = MemoryAdapter::new();
        adapter.fail_next(
            Operation::Stat,
            [Fault::Unavailable, Fault::Throttled(Some(Duration::from_secs(5)))],
        );

        assert!(matches!(
            adapter.stat(&LogicalPath::root()).await,
            Err(Error::Unavailable(_))
        ));
        let err = adapter.stat(&LogicalPath::root()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert!(adapter.rate_limit_signal().is_some());

        assert!(adapter.stat(&LogicalPath::root()).await.is_ok());
        assert_eq!(adapter.calls(Operation::Stat), 3);
        assert_eq!(adapter.calls(Operation::List), 0);
    }

    #[tokio::test]
    async fn test_share_link() {
        let adapter = MemoryAdapter::new();
        adapter.seed_file(&p("/a.txt"), Bytes::from_static(b"x"));

        let link = adapter
            .share_link(&p("/a.txt"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(link.url.starts_with("memory://"));
        assert!(link.expires_at.is_some());

        assert!(adapter
            .share_link(&p("/missing"), Duration::from_secs(60))
            .await
            .is_err());
    }
}
