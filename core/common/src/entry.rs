//! Uniform representation of remote files and folders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{LogicalPath, SourceId};

/// Whether an entry is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// A remote object or node, constructed per response and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Source the entry came from. Set by the gateway, `None` inside adapters.
    #[serde(default)]
    pub source_id: Option<SourceId>,
    /// Provider-native identifier (S3 key, Drive file id, Graph item id).
    pub native_id: String,
    /// Normalized logical path.
    pub path: LogicalPath,
    /// Display name (last path component).
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (None for folders).
    pub size: Option<u64>,
    pub modified: DateTime<Utc>,
    /// ETag, revision or content hash for optimistic concurrency.
    pub etag: Option<String>,
    /// Provider-opaque marker for this entry's position in a paged listing.
    #[serde(default)]
    pub marker: Option<String>,
}

impl FileEntry {
    /// Build a file entry.
    pub fn file(
        native_id: impl Into<String>,
        path: LogicalPath,
        size: u64,
        modified: DateTime<Utc>,
        etag: Option<String>,
    ) -> Self {
        Self {
            source_id: None,
            native_id: native_id.into(),
            name: path.native_name().unwrap_or_else(|| "/".to_string()),
            path,
            kind: EntryKind::File,
            size: Some(size),
            modified,
            etag,
            marker: None,
        }
    }

    /// Build a folder entry.
    pub fn folder(native_id: impl Into<String>, path: LogicalPath, modified: DateTime<Utc>) -> Self {
        Self {
            source_id: None,
            native_id: native_id.into(),
            name: path.native_name().unwrap_or_else(|| "/".to_string()),
            path,
            kind: EntryKind::Folder,
            size: None,
            modified,
            etag: None,
            marker: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    /// Tag the entry with the source it was listed from.
    pub fn with_source(mut self, source_id: &SourceId) -> Self {
        self.source_id = Some(source_id.clone());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_entry_serialization() {
        let entry = FileEntry::file(
            "docs/a.txt",
            LogicalPath::parse("/docs/a.txt").unwrap(),
            1024,
            Utc::now(),
            Some("abc123".to_string()),
        );

        let json = serde_json::to_string(&entry).unwrap();
        let deserialized: FileEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.native_id, entry.native_id);
        assert_eq!(deserialized.name, "a.txt");
        assert_eq!(deserialized.size, Some(1024));
        assert_eq!(deserialized.kind, EntryKind::File);
    }

    #[test]
    fn test_folder_has_no_size() {
        let folder = FileEntry::folder("id", LogicalPath::parse("/docs").unwrap(), Utc::now());
        assert!(folder.is_folder());
        assert_eq!(folder.size, None);
        assert_eq!(folder.name, "docs");
    }

    #[test]
    fn test_with_source_tags_entry() {
        let source = SourceId::new("s1").unwrap();
        let entry = FileEntry::folder("id", LogicalPath::root(), Utc::now()).with_source(&source);
        assert_eq!(entry.source_id, Some(source));
        assert_eq!(entry.name, "/");
    }
}
