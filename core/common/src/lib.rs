//! Common types shared across the Storegate crates.
//!
//! This module provides the normalized error taxonomy, identifiers, logical
//! paths, the uniform file entry and credential material.

pub mod credential;
pub mod entry;
pub mod error;
pub mod types;

pub use credential::{Credential, CredentialSecret};
pub use entry::{EntryKind, FileEntry};
pub use error::{Error, ErrorKind, Result};
pub use types::{ByteRange, LogicalPath, ProviderKind, SensitiveString, SourceId, UserId};
