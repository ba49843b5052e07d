//! Transfer session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use storegate_common::{Error, LogicalPath, Result, SourceId, UserId};
use storegate_storage::{MultipartUpload, PartLimits, PartReceipt};

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Initiated,
    InProgress,
    Completing,
    Completed,
    Aborted,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Aborted | TransferState::Failed
        )
    }

    /// Whether parts may still be transferred.
    pub fn accepts_parts(&self) -> bool {
        matches!(self, TransferState::Initiated | TransferState::InProgress)
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Initiated, InProgress) => true,
            (InProgress, InProgress | Completing) => true,
            // An interrupted or transiently failed completion can be retried.
            (Completing, Completed | InProgress) => true,
            (InProgress | Completing, Failed) => true,
            // A failed upload is aborted to release the provider session.
            (Failed, Aborted) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// A part that has been transferred and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub crc32: u32,
    /// Native part token returned by the provider (uploads only).
    #[serde(default)]
    pub token: Option<String>,
}

/// Persisted state of one chunked upload or resumable download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: String,
    pub owner: UserId,
    pub source_id: SourceId,
    pub path: LogicalPath,
    pub direction: Direction,
    pub total_size: Option<u64>,
    pub part_size: u64,
    /// Known when the total size is.
    pub expected_parts: Option<u32>,
    /// Completed parts by index.
    #[serde(default)]
    pub parts: BTreeMap<u32, PartDescriptor>,
    /// Index of the part flagged as last, for uploads of unknown size.
    #[serde(default)]
    pub last_part_index: Option<u32>,
    /// Provider upload handle.
    #[serde(default)]
    pub upload: Option<MultipartUpload>,
    /// Remote etag when a download started.
    #[serde(default)]
    pub source_etag: Option<String>,
    pub state: TransferState,
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferSession {
    fn new(
        owner: UserId,
        source_id: SourceId,
        path: LogicalPath,
        direction: Direction,
        total_size: Option<u64>,
        part_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            source_id,
            path,
            direction,
            total_size,
            part_size,
            expected_parts: total_size.map(|total| PartLimits::part_count(total, part_size)),
            parts: BTreeMap::new(),
            last_part_index: None,
            upload: None,
            source_etag: None,
            state: TransferState::Initiated,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_upload(
        owner: UserId,
        source_id: SourceId,
        upload: MultipartUpload,
    ) -> Self {
        let mut session = Self::new(
            owner,
            source_id,
            upload.path.clone(),
            Direction::Upload,
            upload.total_size,
            upload.part_size,
        );
        session.upload = Some(upload);
        session
    }

    pub fn new_download(
        owner: UserId,
        source_id: SourceId,
        path: LogicalPath,
        size: u64,
        part_size: u64,
        etag: Option<String>,
    ) -> Self {
        let mut session = Self::new(owner, source_id, path, Direction::Download, Some(size), part_size);
        session.source_etag = etag;
        session
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// - `Conflict` if the lifecycle does not allow the transition
    pub fn transition(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "Transfer {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Record an unrecoverable failure.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TransferState::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Index of the final part, if known.
    pub fn final_index(&self) -> Option<u32> {
        self.expected_parts
            .map(|n| n.saturating_sub(1))
            .or(self.last_part_index)
    }

    /// Byte offset of a part.
    pub fn part_offset(&self, index: u32) -> u64 {
        u64::from(index) * self.part_size
    }

    /// Exact length of a part when the total size is known.
    pub fn expected_part_length(&self, index: u32) -> Option<u64> {
        let total = self.total_size?;
        let offset = self.part_offset(index);
        Some(total.saturating_sub(offset).min(self.part_size))
    }

    pub fn committed_indices(&self) -> Vec<u32> {
        self.parts.keys().copied().collect()
    }

    /// Indices still to be transferred.
    ///
    /// Without a known final index this is only the gaps below the highest
    /// committed part.
    pub fn missing_indices(&self) -> Vec<u32> {
        let upper = match self.final_index() {
            Some(last) => Some(last),
            None => self.parts.keys().next_back().copied(),
        };
        match upper {
            Some(upper) => (0..=upper).filter(|i| !self.parts.contains_key(i)).collect(),
            None => Vec::new(),
        }
    }

    /// Every part up to the known final index has been transferred.
    pub fn has_all_parts(&self) -> bool {
        self.final_index().is_some() && self.missing_indices().is_empty()
    }

    /// Next index a sequential provider will accept.
    pub fn next_sequential_index(&self) -> u32 {
        u32::try_from(self.parts.len()).unwrap_or(u32::MAX)
    }

    /// Bytes transferred so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.length).sum()
    }

    /// Part receipts ordered by index, for completing the provider upload.
    pub fn receipts(&self) -> Vec<PartReceipt> {
        self.parts
            .values()
            .map(|p| PartReceipt {
                index: p.index,
                token: p.token.clone(),
            })
            .collect()
    }

    /// Non-terminal and untouched for longer than `idle`.
    pub fn is_idle(&self, now: DateTime<Utc>, idle: chrono::Duration) -> bool {
        !self.state.is_terminal() && now - self.updated_at > idle
    }

    /// Terminal and older than the retention period.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.state.is_terminal() && now - self.updated_at > retention
    }
}

/// Outside view of a session's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub session_id: String,
    pub direction: Direction,
    pub state: TransferState,
    pub path: LogicalPath,
    pub total_size: Option<u64>,
    pub part_size: u64,
    pub expected_parts: Option<u32>,
    pub committed: Vec<u32>,
    pub missing: Vec<u32>,
    pub transferred_bytes: u64,
    pub failure: Option<String>,
}

impl From<&TransferSession> for TransferStatus {
    fn from(session: &TransferSession) -> Self {
        Self {
            session_id: session.id.clone(),
            direction: session.direction,
            state: session.state,
            path: session.path.clone(),
            total_size: session.total_size,
            part_size: session.part_size,
            expected_parts: session.expected_parts,
            committed: session.committed_indices(),
            missing: session.missing_indices(),
            transferred_bytes: session.transferred_bytes(),
            failure: session.failure.clone(),
        }
    }
}

/// Returned when a transfer starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTicket {
    pub session_id: String,
    pub part_size: u64,
    pub expected_parts: Option<u32>,
}

impl From<&TransferSession> for TransferTicket {
    fn from(session: &TransferSession) -> Self {
        Self {
            session_id: session.id.clone(),
            part_size: session.part_size,
            expected_parts: session.expected_parts,
        }
    }
}
