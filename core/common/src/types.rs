//! Common types used throughout Storegate.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if id is empty
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(
                        concat!($label, " cannot be empty").to_string(),
                    ));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a configured storage source.
    SourceId,
    "SourceId"
);

string_id!(
    /// Authenticated user identity supplied by the session layer.
    UserId,
    "UserId"
);

/// Backend family of a storage source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    S3Compatible,
    OneDrive,
    GoogleDrive,
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3Compatible => "s3",
            ProviderKind::OneDrive => "onedrive",
            ProviderKind::GoogleDrive => "gdrive",
            ProviderKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" | "s3_compatible" => Ok(ProviderKind::S3Compatible),
            "onedrive" | "one_drive" => Ok(ProviderKind::OneDrive),
            "gdrive" | "google_drive" => Ok(ProviderKind::GoogleDrive),
            "memory" => Ok(ProviderKind::Memory),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown provider kind: {}",
                other
            ))),
        }
    }
}

/// A normalized logical path within a storage source, independent of how
/// the provider addresses objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalPath {
    components: Vec<String>,
}

impl LogicalPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, a dot segment, or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            Self::validate_component(comp)?;
        }
        Ok(Self { components })
    }

    fn validate_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        if comp == "." || comp == ".." {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be a dot segment".to_string(),
            ));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain separators".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a path string into a LogicalPath.
    ///
    /// Uses '/' as separator; repeated separators collapse.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/folder name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Join a provider-native name, escaping characters a component cannot hold.
    ///
    /// `%`, `/` and `\` are percent-encoded and dot segments become `%2E`, so
    /// [`native_name`](Self::native_name) recovers the original name.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty name
    pub fn join_native(&self, name: &str) -> crate::Result<Self> {
        self.join(&escape_component(name))
    }

    /// Provider-native form of the last component.
    pub fn native_name(&self) -> Option<String> {
        self.name().map(unescape_component)
    }

    /// Provider-native form of every component.
    pub fn native_components(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|c| unescape_component(c))
            .collect()
    }

    /// Provider-native path relative to the root, without a leading slash.
    pub fn native_relative(&self) -> String {
        self.native_components().join("/")
    }

    /// Whether `other` equals this path or lies beneath it.
    pub fn contains(&self, other: &LogicalPath) -> bool {
        other.components.starts_with(&self.components)
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Path relative to the root, without a leading slash ("" for root).
    pub fn relative(&self) -> String {
        self.components.join("/")
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

fn escape_component(name: &str) -> String {
    match name {
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Names typed without escapes pass through unchanged.
fn unescape_component(component: &str) -> String {
    percent_decode_str(component)
        .decode_utf8_lossy()
        .into_owned()
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

/// A byte range within an object: `length: None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Range starting at `offset` and running to the end of the object.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    /// Inclusive last byte, if bounded.
    pub fn last_byte(&self) -> Option<u64> {
        self.length
            .map(|len| self.offset + len.saturating_sub(1))
    }

    /// Render as an HTTP `Range` header value.
    pub fn to_header(&self) -> String {
        match self.last_byte() {
            Some(end) => format!("bytes={}-{}", self.offset, end),
            None => format!("bytes={}-", self.offset),
        }
    }

    /// Clamp this range to an object of `size` bytes, returning (start, end_exclusive).
    pub fn clamp(&self, size: u64) -> (u64, u64) {
        let start = self.offset.min(size);
        let end = match self.length {
            Some(len) => start.saturating_add(len).min(size),
            None => size,
        };
        (start, end)
    }
}

/// Secret string that zeroizes on drop and never prints its value.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitiveString(String);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for use in a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveString([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_source_id_creation() {
        let id = SourceId::new("src-1").unwrap();
        assert_eq!(id.as_str(), "src-1");
    }

    #[test]
    fn test_native_names_with_separators() {
        let reports = LogicalPath::parse("/reports").unwrap();
        let child = reports.join_native("2024/01 summary.pdf").unwrap();
        assert_eq!(child.to_string_path(), "/reports/2024%2F01 summary.pdf");
        assert_eq!(child.native_name().unwrap(), "2024/01 summary.pdf");
        assert_eq!(child.parent().unwrap(), reports);

        let odd = LogicalPath::root()
            .join_native("..")
            .unwrap()
            .join_native("a\\b")
            .unwrap();
        assert_eq!(odd.native_components(), vec!["..", "a\\b"]);
        assert_eq!(odd.native_relative(), "../a\\b");

        // Round trips through a string form.
        let reparsed = LogicalPath::parse(&child.to_string_path()).unwrap();
        assert_eq!(reparsed.native_name().unwrap(), "2024/01 summary.pdf");

        assert!(reports.join_native("").is_err());
        assert_eq!(
            LogicalPath::parse("/plain name.txt").unwrap().native_name().unwrap(),
            "plain name.txt"
        );
    }

    #[test]
    fn test_ids_reject_empty() {
        assert!(SourceId::new("").is_err());
        assert!(UserId::new("   ").is_err());
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("s3".parse::<ProviderKind>().unwrap(), ProviderKind::S3Compatible);
        assert_eq!("OneDrive".parse::<ProviderKind>().unwrap(), ProviderKind::OneDrive);
        assert_eq!("gdrive".parse::<ProviderKind>().unwrap(), ProviderKind::GoogleDrive);
        assert!("ftp".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_logical_path_root() {
        let path = LogicalPath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert_eq!(path.relative(), "");
    }

    #[test]
    fn test_logical_path_parse_collapses_separators() {
        let path = LogicalPath::parse("//docs///2024/report.pdf/").unwrap();
        assert_eq!(path.components(), &["docs", "2024", "report.pdf"]);
        assert_eq!(path.to_string_path(), "/docs/2024/report.pdf");
    }

    #[test]
    fn test_logical_path_rejects_dot_segments() {
        assert!(LogicalPath::parse("/a/../b").is_err());
        assert!(LogicalPath::root().join(".").is_err());
    }

    #[test]
    fn test_logical_path_contains() {
        let docs = LogicalPath::parse("/docs").unwrap();
        assert!(docs.contains(&LogicalPath::parse("/docs/a.txt").unwrap()));
        assert!(!docs.contains(&LogicalPath::parse("/documents").unwrap()));
    }

    #[test]
    fn test_byte_range_header() {
        assert_eq!(ByteRange::new(0, Some(10)).to_header(), "bytes=0-9");
        assert_eq!(ByteRange::from_offset(512).to_header(), "bytes=512-");
    }

    #[test]
    fn test_byte_range_clamp() {
        assert_eq!(ByteRange::new(5, Some(100)).clamp(20), (5, 20));
        assert_eq!(ByteRange::new(50, None).clamp(20), (20, 20));
    }

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    proptest! {
        #[test]
        fn prop_native_names_survive_escaping(name in "[a-z%./\\\\ ]{1,12}") {
            let path = LogicalPath::root().join_native(&name).unwrap();
            prop_assert_eq!(path.native_name().unwrap(), name);
        }

        #[test]
        fn prop_parse_display_roundtrip(parts in proptest::collection::vec("[a-zA-Z0-9_ -]{1,12}", 0..6)) {
            let parts: Vec<String> = parts
                .into_iter()
                .filter(|p| !p.trim().is_empty() && p != "." && p != "..")
                .collect();
            let path = LogicalPath::from_components(parts.clone()).unwrap();
            let reparsed = LogicalPath::parse(&path.to_string_path()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
