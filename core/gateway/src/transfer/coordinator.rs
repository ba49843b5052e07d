//! Transfer coordinator: chunked uploads and resumable downloads that span
//! many requests.
//!
//! Session state is checked and transitioned under a per-session lock; the
//! provider calls themselves run outside it. Every change is written to the
//! [`SessionStore`] before the caller sees it, so a restarted gateway resumes
//! from the last acknowledged part.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use storegate_common::{
    ByteRange, Error, FileEntry, LogicalPath, Result, SourceId, UserId,
};
use storegate_storage::{collect_stream, PartLimits, PartUpload, StorageAdapter};

use super::session::{
    Direction, PartDescriptor, TransferSession, TransferState, TransferStatus, TransferTicket,
};
use super::store::SessionStore;
use crate::config::TransferSettings;
use crate::governor::Governor;

/// Acknowledgement of one transferred part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    pub index: u32,
    pub crc32: u32,
    pub committed_parts: usize,
    /// Every part up to the known final index is present.
    pub ready: bool,
}

impl PartAck {
    fn new(session: &TransferSession, index: u32, crc32: u32) -> Self {
        Self {
            index,
            crc32,
            committed_parts: session.parts.len(),
            ready: session.has_all_parts(),
        }
    }
}

/// One fetched part of a download.
#[derive(Debug, Clone)]
pub struct DownloadedPart {
    pub index: u32,
    pub offset: u64,
    pub data: Bytes,
    pub crc32: u32,
}

/// Outcome of one collection pass.
#[derive(Debug, Default)]
pub struct CollectReport {
    /// Idle sessions that were aborted.
    pub aborted: Vec<TransferSession>,
    /// Terminal sessions past retention that were deleted.
    pub purged: usize,
    /// Purged failed uploads whose provider session may still be open.
    pub released: Vec<TransferSession>,
}

impl CollectReport {
    /// Sessions whose provider upload should be abandoned.
    pub fn provider_uploads(&self) -> impl Iterator<Item = &TransferSession> {
        self.aborted
            .iter()
            .chain(self.released.iter())
            .filter(|s| s.upload.is_some())
    }
}

struct LiveSession {
    session: Mutex<TransferSession>,
    /// Part indices currently being sent to the provider.
    in_flight: StdMutex<HashSet<u32>>,
}

impl LiveSession {
    fn new(session: TransferSession) -> Self {
        Self {
            session: Mutex::new(session),
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_in_flight(&self) -> bool {
        !self.in_flight().is_empty()
    }
}

/// Marks a part in flight until dropped, including when the caller's future
/// is cancelled.
struct InFlight {
    live: Arc<LiveSession>,
    index: u32,
}

impl InFlight {
    fn acquire(live: &Arc<LiveSession>, index: u32) -> Result<Self> {
        if !live.in_flight().insert(index) {
            return Err(Error::Conflict(format!("Part {} is already uploading", index)));
        }
        Ok(Self {
            live: live.clone(),
            index,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.live.in_flight().remove(&self.index);
    }
}

/// Returns a session stuck in `Completing` to `InProgress` if the completing
/// call is dropped before the provider answered.
struct CompletionGuard {
    live: Arc<LiveSession>,
    store: Arc<dyn SessionStore>,
    armed: bool,
}

impl CompletionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let live = self.live.clone();
        let store = self.store.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut session = live.session.lock().await;
                if session.state == TransferState::Completing
                    && session.transition(TransferState::InProgress).is_ok()
                {
                    if let Err(e) = store.put(&session).await {
                        warn!(session = %session.id, "Failed to persist interrupted completion: {}", e);
                    }
                }
            });
        }
    }
}

/// Errors after which retrying the same part cannot succeed.
fn is_permanent(err: &Error) -> bool {
    !err.is_retryable() && !matches!(err, Error::Timeout(_) | Error::Cancelled(_))
}

fn ensure_owner(session: &TransferSession, owner: &UserId) -> Result<()> {
    if &session.owner != owner {
        return Err(Error::NotFound(format!("Transfer not found: {}", session.id)));
    }
    Ok(())
}

fn ensure_direction(session: &TransferSession, direction: Direction) -> Result<()> {
    if session.direction != direction {
        return Err(Error::InvalidInput(format!(
            "Transfer {} is not an {:?}",
            session.id, direction
        )));
    }
    Ok(())
}

/// Mark a session failed, stepping through `InProgress` if no part landed yet.
fn fail_session(session: &mut TransferSession, reason: String) -> Result<()> {
    if session.state == TransferState::Initiated {
        session.transition(TransferState::InProgress)?;
    }
    session.fail(reason)
}

/// Reset a completion interrupted by a restart.
fn resume(mut session: TransferSession) -> Result<(TransferSession, bool)> {
    if session.state == TransferState::Completing {
        session.transition(TransferState::InProgress)?;
        return Ok((session, true));
    }
    Ok((session, false))
}

/// Coordinates multipart transfer sessions.
pub struct TransferCoordinator {
    store: Arc<dyn SessionStore>,
    governor: Arc<Governor>,
    settings: TransferSettings,
    part_timeout: Duration,
    live: Mutex<HashMap<String, Arc<LiveSession>>>,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        governor: Arc<Governor>,
        settings: TransferSettings,
        part_timeout: Duration,
    ) -> Self {
        Self {
            store,
            governor,
            settings,
            part_timeout,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    async fn live(&self, id: &str) -> Result<Arc<LiveSession>> {
        let mut live = self.live.lock().await;
        if let Some(session) = live.get(id) {
            return Ok(session.clone());
        }

        let stored = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transfer not found: {}", id)))?;
        let (session, changed) = resume(stored)?;
        if changed {
            self.store.put(&session).await?;
        }

        let entry = Arc::new(LiveSession::new(session));
        live.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    async fn register(&self, session: TransferSession) -> Result<TransferTicket> {
        self.store.put(&session).await?;
        let ticket = TransferTicket::from(&session);
        self.live
            .lock()
            .await
            .insert(session.id.clone(), Arc::new(LiveSession::new(session)));
        Ok(ticket)
    }

    /// Reload non-terminal sessions after a restart.
    ///
    /// Sessions that were completing when the process stopped go back to
    /// `InProgress` so the caller can complete them again.
    pub async fn recover(&self) -> Result<usize> {
        let sessions = self.store.list_active().await?;
        let mut live = self.live.lock().await;
        let mut recovered = 0;

        for stored in sessions {
            if live.contains_key(&stored.id) {
                continue;
            }
            let (session, changed) = resume(stored)?;
            if changed {
                warn!(session = %session.id, "Completion was interrupted; session reopened");
                self.store.put(&session).await?;
            }
            live.insert(session.id.clone(), Arc::new(LiveSession::new(session)));
            recovered += 1;
        }

        info!(count = recovered, "Recovered transfer sessions");
        Ok(recovered)
    }

    /// Snapshot of a session owned by `owner`.
    ///
    /// # Errors
    /// - `NotFound` if the session does not exist or belongs to another user
    pub async fn session(&self, owner: &UserId, id: &str) -> Result<TransferSession> {
        let live = self.live(id).await?;
        let session = live.session.lock().await;
        ensure_owner(&session, owner)?;
        Ok(session.clone())
    }

    pub async fn status(&self, owner: &UserId, id: &str) -> Result<TransferStatus> {
        Ok(TransferStatus::from(&self.session(owner, id).await?))
    }

    /// Every stored session of a user, newest first.
    pub async fn sessions_for(&self, owner: &UserId) -> Result<Vec<TransferStatus>> {
        let mut sessions: Vec<_> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|s| &s.owner == owner)
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions.iter().map(TransferStatus::from).collect())
    }

    /// Open a multipart upload.
    ///
    /// The part size is negotiated against the provider's limits, starting
    /// from `part_size` or the configured default.
    ///
    /// # Errors
    /// - `InvalidInput` for the root path or a total too large for the provider
    pub async fn start_upload(
        &self,
        adapter: &dyn StorageAdapter,
        owner: &UserId,
        source_id: &SourceId,
        path: &LogicalPath,
        total_size: Option<u64>,
        part_size: Option<u64>,
    ) -> Result<TransferTicket> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to the root folder".to_string()));
        }

        let limits = adapter.part_limits();
        let requested = part_size.unwrap_or(self.settings.default_part_size);
        let part_size = limits.negotiate(requested, total_size);
        if let Some(total) = total_size {
            if PartLimits::part_count(total, part_size) > limits.max_parts {
                return Err(Error::InvalidInput(format!(
                    "{} bytes exceed the provider's multipart limit",
                    total
                )));
            }
        }

        let upload = self
            .governor
            .execute(source_id, adapter, "begin_multipart", move || {
                adapter.begin_multipart(path, total_size, part_size)
            })
            .await?;

        let session = TransferSession::new_upload(owner.clone(), source_id.clone(), upload);
        info!(
            session = %session.id,
            source = %source_id,
            path = %path,
            part_size,
            "Upload started"
        );
        self.register(session).await
    }

    fn validate_part(
        session: &TransferSession,
        index: u32,
        length: u64,
        last: bool,
    ) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidInput(msg));

        if let Some(expected_parts) = session.expected_parts {
            if index >= expected_parts {
                return invalid(format!(
                    "Part {} out of range; transfer has {} parts",
                    index, expected_parts
                ));
            }
            let expected = session.expected_part_length(index).unwrap_or(session.part_size);
            if length != expected {
                return invalid(format!(
                    "Part {} must be {} bytes, got {}",
                    index, expected, length
                ));
            }
            return Ok(());
        }

        if let Some(declared) = session.last_part_index {
            if index > declared {
                return invalid(format!("Part {} follows the last part {}", index, declared));
            }
            if last && index != declared {
                return invalid(format!("Last part already declared as {}", declared));
            }
        }
        if last {
            if let Some(highest) = session.parts.keys().next_back() {
                if *highest > index {
                    return invalid(format!("Part {} already follows part {}", highest, index));
                }
            }
        }
        if length > session.part_size || (!last && length != session.part_size) {
            return invalid(format!(
                "Part {} must be {} bytes (only the last part may be shorter), got {}",
                index, session.part_size, length
            ));
        }
        Ok(())
    }

    /// Upload one part.
    ///
    /// Re-sending a committed part with the same content is acknowledged
    /// without contacting the provider. Sequential providers only accept the
    /// next contiguous index, one part at a time.
    ///
    /// # Errors
    /// - `InvalidInput` on a checksum mismatch or a malformed part
    /// - `Conflict` if the session no longer accepts parts or the index is out of turn
    /// - The provider error; a permanent one also moves the session to `Failed`
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part(
        &self,
        adapter: &dyn StorageAdapter,
        owner: &UserId,
        id: &str,
        index: u32,
        data: Bytes,
        checksum: Option<u32>,
        last: bool,
    ) -> Result<PartAck> {
        let crc32 = crc32fast::hash(&data);
        if let Some(expected) = checksum {
            if expected != crc32 {
                return Err(Error::InvalidInput(format!(
                    "Checksum mismatch for part {}: expected {:08x}, got {:08x}",
                    index, expected, crc32
                )));
            }
        }

        let live = self.live(id).await?;
        let limits = adapter.part_limits();

        let (source_id, upload, part, _in_flight) = {
            let session = live.session.lock().await;
            ensure_owner(&session, owner)?;
            ensure_direction(&session, Direction::Upload)?;
            if !session.state.accepts_parts() {
                return Err(Error::Conflict(format!(
                    "Transfer {} is {:?}",
                    session.id, session.state
                )));
            }

            if let Some(existing) = session.parts.get(&index) {
                if existing.crc32 == crc32 && existing.length == data.len() as u64 {
                    return Ok(PartAck::new(&session, index, crc32));
                }
                if !limits.independent_parts {
                    return Err(Error::Conflict(format!(
                        "Part {} was already uploaded with different content",
                        index
                    )));
                }
            }

            Self::validate_part(&session, index, data.len() as u64, last)?;

            if !limits.independent_parts {
                let next = session.next_sequential_index();
                if index != next {
                    return Err(Error::Conflict(format!(
                        "Provider needs parts in order; expected part {}, got {}",
                        next, index
                    )));
                }
                if live.has_in_flight() {
                    return Err(Error::Conflict(format!(
                        "Part {} is still uploading",
                        next.saturating_sub(1)
                    )));
                }
            }

            let in_flight = InFlight::acquire(&live, index)?;
            let upload = session.upload.clone().ok_or_else(|| {
                Error::Unknown(format!("Transfer {} has no provider upload", session.id))
            })?;
            let is_last = match session.final_index() {
                Some(final_index) => index == final_index,
                None => last,
            };
            let part = PartUpload {
                index,
                offset: session.part_offset(index),
                data,
                is_last,
            };
            (session.source_id.clone(), upload, part, in_flight)
        };

        let outcome = {
            let (upload, part) = (&upload, &part);
            let call = self.governor.execute(&source_id, adapter, "upload_part", move || {
                adapter.upload_part(upload, part)
            });
            match tokio::time::timeout(self.part_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "Part {} of transfer {} timed out",
                    index, id
                ))),
            }
        };

        let mut session = live.session.lock().await;
        match outcome {
            Ok(receipt) => {
                if !session.state.accepts_parts() {
                    return Err(Error::Conflict(format!(
                        "Transfer {} became {:?} while part {} was uploading",
                        session.id, session.state, index
                    )));
                }
                session.parts.insert(
                    index,
                    PartDescriptor {
                        index,
                        offset: part.offset,
                        length: part.data.len() as u64,
                        crc32,
                        token: receipt.token,
                    },
                );
                if last && session.total_size.is_none() {
                    session.last_part_index = Some(index);
                }
                session.transition(TransferState::InProgress)?;
                self.store.put(&session).await?;

                debug!(session = %session.id, part = index, "Part committed");
                Ok(PartAck::new(&session, index, crc32))
            }
            Err(err) => {
                if is_permanent(&err) && session.state.accepts_parts() {
                    warn!(session = %session.id, part = index, "Part failed permanently: {}", err);
                    fail_session(&mut session, format!("Part {} failed: {}", index, err))?;
                    self.store.put(&session).await?;
                }
                Err(err)
            }
        }
    }

    /// Finish an upload once every part is present.
    ///
    /// # Errors
    /// - `Conflict` if parts are missing or in flight (the session stays
    ///   open), or the session is completing, completed or closed
    pub async fn complete_upload(
        &self,
        adapter: &dyn StorageAdapter,
        owner: &UserId,
        id: &str,
    ) -> Result<FileEntry> {
        let live = self.live(id).await?;

        let (source_id, upload, receipts) = {
            let mut session = live.session.lock().await;
            ensure_owner(&session, owner)?;
            ensure_direction(&session, Direction::Upload)?;
            Self::begin_completion(&live, &mut session)?;
            self.store.put(&session).await?;

            let upload = session.upload.clone().ok_or_else(|| {
                Error::Unknown(format!("Transfer {} has no provider upload", session.id))
            })?;
            (session.source_id.clone(), upload, session.receipts())
        };

        let mut guard = CompletionGuard {
            live: live.clone(),
            store: self.store.clone(),
            armed: true,
        };
        let outcome = {
            let (upload, receipts) = (&upload, receipts.as_slice());
            self.governor
                .execute(&source_id, adapter, "complete_multipart", move || {
                    adapter.complete_multipart(upload, receipts)
                })
                .await
        };
        let mut session = live.session.lock().await;
        guard.disarm();
        match outcome {
            Ok(entry) => {
                session.transition(TransferState::Completed)?;
                self.store.put(&session).await?;
                info!(session = %session.id, path = %session.path, "Upload completed");
                Ok(entry)
            }
            Err(err) => {
                if session.state == TransferState::Completing {
                    if is_permanent(&err) {
                        warn!(session = %session.id, "Completion failed permanently: {}", err);
                        session.fail(format!("Completion failed: {}", err))?;
                    } else {
                        session.transition(TransferState::InProgress)?;
                    }
                    self.store.put(&session).await?;
                }
                Err(err)
            }
        }
    }

    /// Check-and-transition to `Completing`.
    fn begin_completion(live: &LiveSession, session: &mut TransferSession) -> Result<()> {
        match session.state {
            TransferState::Completed => {
                return Err(Error::Conflict(format!(
                    "Transfer {} is already completed",
                    session.id
                )))
            }
            TransferState::Completing => {
                return Err(Error::Conflict(format!(
                    "Transfer {} is already completing",
                    session.id
                )))
            }
            TransferState::Aborted | TransferState::Failed => {
                return Err(Error::Conflict(format!(
                    "Transfer {} is {:?}",
                    session.id, session.state
                )))
            }
            TransferState::Initiated | TransferState::InProgress => {}
        }

        if live.has_in_flight() {
            return Err(Error::Conflict(format!(
                "Transfer {} has parts in flight",
                session.id
            )));
        }
        if session.final_index().is_none() {
            return Err(Error::Conflict(format!(
                "Transfer {} has no part flagged as last",
                session.id
            )));
        }
        let missing = session.missing_indices();
        if !missing.is_empty() {
            return Err(Error::Conflict(format!(
                "Transfer {} is missing parts {:?}",
                session.id, missing
            )));
        }
        session.transition(TransferState::Completing)
    }

    /// Abort a session. Aborting an aborted session is a no-op.
    ///
    /// The provider upload is abandoned on a best-effort basis when an
    /// adapter is given.
    ///
    /// # Errors
    /// - `Conflict` if the session already completed
    pub async fn abort(
        &self,
        adapter: Option<&dyn StorageAdapter>,
        owner: &UserId,
        id: &str,
    ) -> Result<()> {
        let live = self.live(id).await?;

        let (source_id, upload) = {
            let mut session = live.session.lock().await;
            ensure_owner(&session, owner)?;
            match session.state {
                TransferState::Aborted => return Ok(()),
                TransferState::Completed => {
                    return Err(Error::Conflict(format!(
                        "Transfer {} is already completed",
                        session.id
                    )))
                }
                _ => {}
            }
            session.transition(TransferState::Aborted)?;
            self.store.put(&session).await?;
            info!(session = %session.id, "Transfer aborted");
            (session.source_id.clone(), session.upload.clone())
        };

        if let (Some(adapter), Some(upload)) = (adapter, upload) {
            self.release_upload(adapter, &source_id, &upload).await;
        }
        Ok(())
    }

    /// Abandon a provider upload, logging instead of failing.
    pub async fn release_upload(
        &self,
        adapter: &dyn StorageAdapter,
        source_id: &SourceId,
        upload: &storegate_storage::MultipartUpload,
    ) {
        let result = self
            .governor
            .execute(source_id, adapter, "abort_multipart", move || {
                adapter.abort_multipart(upload)
            })
            .await;
        if let Err(e) = result {
            warn!(
                source = %source_id,
                upload = %upload.upload_id,
                "Failed to abort provider upload: {}",
                e
            );
        }
    }

    /// Open a resumable download of a file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `InvalidInput` if the path is a folder
    pub async fn start_download(
        &self,
        adapter: &dyn StorageAdapter,
        owner: &UserId,
        source_id: &SourceId,
        path: &LogicalPath,
        part_size: Option<u64>,
    ) -> Result<TransferTicket> {
        let entry = self
            .governor
            .execute(source_id, adapter, "stat", move || adapter.stat(path))
            .await?;
        if entry.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a folder", path)));
        }

        let part_size = part_size.unwrap_or(self.settings.default_part_size).max(1);
        let session = TransferSession::new_download(
            owner.clone(),
            source_id.clone(),
            path.clone(),
            entry.size.unwrap_or(0),
            part_size,
            entry.etag,
        );
        info!(session = %session.id, source = %source_id, path = %path, "Download started");
        self.register(session).await
    }

    /// Fetch one part of a download.
    ///
    /// # Errors
    /// - `Conflict` if the remote file changed since the download started;
    ///   the session fails
    pub async fn download_part(
        &self,
        adapter: &dyn StorageAdapter,
        owner: &UserId,
        id: &str,
        index: u32,
    ) -> Result<DownloadedPart> {
        let live = self.live(id).await?;

        let (source_id, path, offset, length, etag, total) = {
            let session = live.session.lock().await;
            ensure_owner(&session, owner)?;
            ensure_direction(&session, Direction::Download)?;
            if !session.state.accepts_parts() {
                return Err(Error::Conflict(format!(
                    "Transfer {} is {:?}",
                    session.id, session.state
                )));
            }
            let expected_parts = session.expected_parts.unwrap_or(1);
            if index >= expected_parts {
                return Err(Error::InvalidInput(format!(
                    "Part {} out of range; transfer has {} parts",
                    index, expected_parts
                )));
            }
            (
                session.source_id.clone(),
                session.path.clone(),
                session.part_offset(index),
                session.expected_part_length(index).unwrap_or(0),
                session.source_etag.clone(),
                session.total_size,
            )
        };

        let path = &path;
        let current = self
            .governor
            .execute(&source_id, adapter, "stat", move || adapter.stat(path))
            .await?;
        let etag_changed = matches!((&etag, &current.etag), (Some(a), Some(b)) if a != b);
        if etag_changed || current.size != total {
            let mut session = live.session.lock().await;
            if session.state.accepts_parts() {
                fail_session(&mut session, "Remote file changed during download".to_string())?;
                self.store.put(&session).await?;
            }
            return Err(Error::Conflict(format!("{} changed since the download started", path)));
        }

        let data = if length == 0 {
            Bytes::new()
        } else {
            let range = ByteRange::new(offset, Some(length));
            let call = self.governor.execute(&source_id, adapter, "read", move || async move {
                collect_stream(adapter.read(path, Some(range)).await?).await
            });
            match tokio::time::timeout(self.part_timeout, call).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "Part {} of transfer {} timed out",
                        index, id
                    )))
                }
            }
        };
        let crc32 = crc32fast::hash(&data);

        let mut session = live.session.lock().await;
        if session.state.accepts_parts() {
            session.parts.insert(
                index,
                PartDescriptor {
                    index,
                    offset,
                    length: data.len() as u64,
                    crc32,
                    token: None,
                },
            );
            session.transition(TransferState::InProgress)?;
            self.store.put(&session).await?;
        }

        Ok(DownloadedPart {
            index,
            offset,
            data,
            crc32,
        })
    }

    /// Close a download once every part was fetched.
    ///
    /// # Errors
    /// - `Conflict` as for [`complete_upload`](Self::complete_upload)
    pub async fn complete_download(&self, owner: &UserId, id: &str) -> Result<TransferStatus> {
        let live = self.live(id).await?;
        let mut session = live.session.lock().await;
        ensure_owner(&session, owner)?;
        ensure_direction(&session, Direction::Download)?;
        Self::begin_completion(&live, &mut session)?;
        session.transition(TransferState::Completed)?;
        self.store.put(&session).await?;
        info!(session = %session.id, "Download completed");
        Ok(TransferStatus::from(&*session))
    }

    /// Abort every open or failed session of a source, returning them.
    ///
    /// Failed sessions are included so their provider uploads can be released
    /// while the source's credentials still exist.
    pub async fn abort_for_source(&self, source_id: &SourceId) -> Result<Vec<TransferSession>> {
        let mut aborted = Vec::new();
        for stored in self.store.list_all().await? {
            if &stored.source_id != source_id
                || !stored.state.can_transition_to(TransferState::Aborted)
            {
                continue;
            }
            let live = self.live(&stored.id).await?;
            let mut session = live.session.lock().await;
            if !session.state.can_transition_to(TransferState::Aborted) {
                continue;
            }
            session.transition(TransferState::Aborted)?;
            session.failure = Some("Source removed".to_string());
            self.store.put(&session).await?;
            aborted.push(session.clone());
        }
        if !aborted.is_empty() {
            info!(source = %source_id, count = aborted.len(), "Aborted transfers of source");
        }
        Ok(aborted)
    }

    /// Abort idle sessions and delete terminal ones past retention.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<CollectReport> {
        let idle = chrono::Duration::from_std(self.settings.idle_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(self.settings.retention())
            .unwrap_or(chrono::Duration::MAX);
        let mut report = CollectReport::default();

        for stored in self.store.list_all().await? {
            if stored.is_expired(now, retention) {
                self.store.remove(&stored.id).await?;
                self.live.lock().await.remove(&stored.id);
                report.purged += 1;
                if stored.state == TransferState::Failed {
                    report.released.push(stored);
                }
                continue;
            }

            if !stored.is_idle(now, idle) {
                continue;
            }
            let live = self.live(&stored.id).await?;
            if live.has_in_flight() {
                continue;
            }
            let mut session = live.session.lock().await;
            if !session.is_idle(now, idle) {
                continue;
            }
            session.transition(TransferState::Aborted)?;
            session.failure = Some("Idle timeout".to_string());
            self.store.put(&session).await?;
            debug!(session = %session.id, "Idle transfer aborted");
            report.aborted.push(session.clone());
        }

        if report.purged > 0 || !report.aborted.is_empty() {
            info!(
                aborted = report.aborted.len(),
                purged = report.purged,
                "Transfer collection finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{MemoryRateLimiter, RetryConfig};
    use crate::transfer::store::MemorySessionStore;
    use storegate_storage::{
        Fault, MemoryAdapter, Operation, RateQuota, WriteOptions,
    };

    const QUOTA: RateQuota = RateQuota {
        per_second: 10_000.0,
        burst: 10_000,
    };

    fn governor() -> Arc<Governor> {
        Arc::new(Governor::new(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            Arc::new(MemoryRateLimiter::default()),
            QUOTA,
        ))
    }

    fn coordinator_with(store: Arc<dyn SessionStore>) -> TransferCoordinator {
        TransferCoordinator::new(
            store,
            governor(),
            TransferSettings::default(),
            Duration::from_secs(5),
        )
    }

    fn coordinator() -> TransferCoordinator {
        coordinator_with(Arc::new(MemorySessionStore::new()))
    }

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn source() -> SourceId {
        SourceId::new("mem").unwrap()
    }

    fn path(p: &str) -> LogicalPath {
        LogicalPath::parse(p).unwrap()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 199) as u8).collect::<Vec<u8>>())
    }

    fn sequential() -> MemoryAdapter {
        MemoryAdapter::new().with_limits(storegate_storage::PartLimits {
            independent_parts: false,
            ..MemoryAdapter::DEFAULT_LIMITS
        })
    }

    #[tokio::test]
    async fn test_completion_dropped_while_waiting_for_lock_reopens() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(10), Some(10))
            .await
            .unwrap();
        coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 0, payload(10), None, true)
            .await
            .unwrap();

        let live = coordinator.live(&ticket.session_id).await.unwrap();
        adapter.set_latency(Duration::from_millis(30));
        let caller = alice();
        let complete = coordinator.complete_upload(&adapter, &caller, &ticket.session_id);
        // Grab the session while the provider call is in flight and keep it
        // until the caller gives up.
        let hold = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _session = live.session.lock().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        };
        let gave_up = tokio::time::timeout(Duration::from_millis(100), async {
            tokio::join!(complete, hold)
        })
        .await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(live.session.lock().await.state, TransferState::InProgress);
    }

    #[tokio::test]
    async fn test_out_of_order_parts_complete() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let data = payload(25);
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(25), Some(10))
            .await
            .unwrap();
        assert_eq!(ticket.part_size, 10);
        assert_eq!(ticket.expected_parts, Some(3));

        for index in [2u32, 0, 1] {
            let start = index as usize * 10;
            let end = (start + 10).min(25);
            coordinator
                .upload_part(&adapter, &alice(), &ticket.session_id, index, data.slice(start..end), None, false)
                .await
                .unwrap();
        }

        let entry = coordinator
            .complete_upload(&adapter, &alice(), &ticket.session_id)
            .await
            .unwrap();
        assert_eq!(entry.size, Some(25));
        let stored = collect_stream(adapter.read(&path("/f.bin"), None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn test_premature_complete_then_exactly_once() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let data = payload(20);
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(20), Some(10))
            .await
            .unwrap();
        let id = ticket.session_id.as_str();

        coordinator
            .upload_part(&adapter, &alice(), id, 0, data.slice(0..10), None, false)
            .await
            .unwrap();
        let err = coordinator.complete_upload(&adapter, &alice(), id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            coordinator.status(&alice(), id).await.unwrap().state,
            TransferState::InProgress
        );

        coordinator
            .upload_part(&adapter, &alice(), id, 1, data.slice(10..20), None, false)
            .await
            .unwrap();
        coordinator.complete_upload(&adapter, &alice(), id).await.unwrap();

        let err = coordinator.complete_upload(&adapter, &alice(), id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(adapter.calls(Operation::CompleteMultipart), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(4), Some(4))
            .await
            .unwrap();
        let data = Bytes::from_static(b"abcd");

        let err = coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 0, data.clone(), Some(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(adapter.calls(Operation::UploadPart), 0);

        let ack = coordinator
            .upload_part(
                &adapter,
                &alice(),
                &ticket.session_id,
                0,
                data.clone(),
                Some(crc32fast::hash(&data)),
                false,
            )
            .await
            .unwrap();
        assert!(ack.ready);
    }

    #[tokio::test]
    async fn test_resent_part_is_acknowledged_once() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(8), Some(4))
            .await
            .unwrap();
        for _ in 0..2 {
            coordinator
                .upload_part(&adapter, &alice(), &ticket.session_id, 0, Bytes::from_static(b"abcd"), None, false)
                .await
                .unwrap();
        }
        assert_eq!(adapter.calls(Operation::UploadPart), 1);
    }

    #[tokio::test]
    async fn test_sequential_provider_requires_next_index() {
        let adapter = sequential();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/s.bin"), Some(8), Some(4))
            .await
            .unwrap();

        let err = coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 1, Bytes::from_static(b"efgh"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        for (index, chunk) in [(0u32, b"abcd"), (1, b"efgh")] {
            coordinator
                .upload_part(&adapter, &alice(), &ticket.session_id, index, Bytes::from_static(chunk), None, false)
                .await
                .unwrap();
        }
        coordinator
            .complete_upload(&adapter, &alice(), &ticket.session_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_size_uses_last_flag() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/stream.bin"), None, Some(4))
            .await
            .unwrap();
        let id = ticket.session_id.as_str();
        assert_eq!(ticket.expected_parts, None);

        coordinator
            .upload_part(&adapter, &alice(), id, 0, Bytes::from_static(b"abcd"), None, false)
            .await
            .unwrap();
        let err = coordinator.complete_upload(&adapter, &alice(), id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Short parts are only allowed as the last one.
        let err = coordinator
            .upload_part(&adapter, &alice(), id, 1, Bytes::from_static(b"ef"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let ack = coordinator
            .upload_part(&adapter, &alice(), id, 1, Bytes::from_static(b"ef"), None, true)
            .await
            .unwrap();
        assert!(ack.ready);

        let entry = coordinator.complete_upload(&adapter, &alice(), id).await.unwrap();
        assert_eq!(entry.size, Some(6));
    }

    #[tokio::test]
    async fn test_permanent_part_failure_fails_session() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(4), Some(4))
            .await
            .unwrap();
        adapter.fail_next(Operation::UploadPart, [Fault::QuotaExceeded]);

        let err = coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 0, Bytes::from_static(b"abcd"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));

        let status = coordinator.status(&alice(), &ticket.session_id).await.unwrap();
        assert_eq!(status.state, TransferState::Failed);
        assert!(status.failure.is_some());

        coordinator
            .abort(Some(&adapter), &alice(), &ticket.session_id)
            .await
            .unwrap();
        assert_eq!(adapter.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_transient_part_failure_keeps_session_open() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(4), Some(4))
            .await
            .unwrap();
        adapter.fail_next(
            Operation::UploadPart,
            [Fault::Unavailable, Fault::Unavailable, Fault::Unavailable],
        );

        let err = coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 0, Bytes::from_static(b"abcd"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        let status = coordinator.status(&alice(), &ticket.session_id).await.unwrap();
        assert_eq!(status.state, TransferState::Initiated);
        assert_eq!(status.missing, vec![0]);
    }

    #[tokio::test]
    async fn test_double_abort_is_noop() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(8), Some(4))
            .await
            .unwrap();

        coordinator.abort(Some(&adapter), &alice(), &ticket.session_id).await.unwrap();
        coordinator.abort(Some(&adapter), &alice(), &ticket.session_id).await.unwrap();
        assert_eq!(adapter.calls(Operation::AbortMultipart), 1);
        assert_eq!(
            coordinator.status(&alice(), &ticket.session_id).await.unwrap().state,
            TransferState::Aborted
        );

        let err = coordinator
            .upload_part(&adapter, &alice(), &ticket.session_id, 0, Bytes::from_static(b"abcd"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_other_user_sees_not_found() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let ticket = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(8), Some(4))
            .await
            .unwrap();
        let bob = UserId::new("bob").unwrap();
        let err = coordinator.status(&bob, &ticket.session_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = coordinator.abort(None, &bob, &ticket.session_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_store() {
        let adapter = MemoryAdapter::new();
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let data = payload(8);

        let id = {
            let coordinator = coordinator_with(store.clone());
            let ticket = coordinator
                .start_upload(&adapter, &alice(), &source(), &path("/f.bin"), Some(8), Some(4))
                .await
                .unwrap();
            coordinator
                .upload_part(&adapter, &alice(), &ticket.session_id, 0, data.slice(0..4), None, false)
                .await
                .unwrap();
            ticket.session_id
        };

        let restarted = coordinator_with(store);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        let status = restarted.status(&alice(), &id).await.unwrap();
        assert_eq!(status.committed, vec![0]);
        assert_eq!(status.missing, vec![1]);

        restarted
            .upload_part(&adapter, &alice(), &id, 1, data.slice(4..8), None, false)
            .await
            .unwrap();
        restarted.complete_upload(&adapter, &alice(), &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_in_parts() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let data = payload(10);
        adapter.seed_file(&path("/d.bin"), data.clone());

        let ticket = coordinator
            .start_download(&adapter, &alice(), &source(), &path("/d.bin"), Some(4))
            .await
            .unwrap();
        assert_eq!(ticket.expected_parts, Some(3));

        let mut assembled = Vec::new();
        for index in 0..3 {
            let part = coordinator
                .download_part(&adapter, &alice(), &ticket.session_id, index)
                .await
                .unwrap();
            assert_eq!(part.crc32, crc32fast::hash(&part.data));
            assembled.extend_from_slice(&part.data);
        }
        assert_eq!(Bytes::from(assembled), data);

        let status = coordinator
            .complete_download(&alice(), &ticket.session_id)
            .await
            .unwrap();
        assert_eq!(status.state, TransferState::Completed);
        assert!(coordinator
            .complete_download(&alice(), &ticket.session_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_download_detects_remote_change() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        adapter.seed_file(&path("/d.bin"), payload(10));

        let ticket = coordinator
            .start_download(&adapter, &alice(), &source(), &path("/d.bin"), Some(4))
            .await
            .unwrap();
        adapter
            .write(&path("/d.bin"), payload(12), &WriteOptions::overwrite())
            .await
            .unwrap();

        let err = coordinator
            .download_part(&adapter, &alice(), &ticket.session_id, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            coordinator.status(&alice(), &ticket.session_id).await.unwrap().state,
            TransferState::Failed
        );
    }

    #[tokio::test]
    async fn test_collect_idle_and_expired() {
        let adapter = MemoryAdapter::new();
        let coordinator = coordinator();
        let open = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/a.bin"), Some(8), Some(4))
            .await
            .unwrap();
        let done = coordinator
            .start_upload(&adapter, &alice(), &source(), &path("/b.bin"), Some(8), Some(4))
            .await
            .unwrap();
        coordinator.abort(Some(&adapter), &alice(), &done.session_id).await.unwrap();

        let soon = Utc::now() + chrono::Duration::hours(25);
        let report = coordinator.collect(soon).await.unwrap();
        assert_eq!(report.aborted.len(), 1);
        assert_eq!(report.aborted[0].id, open.session_id);
        assert_eq!(report.provider_uploads().count(), 1);
        assert_eq!(report.purged, 0);

        let much_later = Utc::now() + chrono::Duration::days(8);
        let report = coordinator.collect(much_later).await.unwrap();
        assert_eq!(report.purged, 2);
        assert!(coordinator.status(&alice(), &open.session_id).await.is_err());
    }
}
