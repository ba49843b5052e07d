//! Google Drive storage adapter.
//!
//! This module provides a storage backend using the Drive v3 API with:
//! - bearer credentials from the gateway's credential source
//! - resumable uploads in 256 KiB aligned chunks
//! - path-to-ID caching for performance

pub mod client;
pub mod provider;

use std::sync::Arc;

use storegate_common::Result;

use crate::provider::{CredentialSource, StorageAdapter};
use crate::registry::AdapterConfig;

pub use client::DriveClient;
pub use provider::GDriveAdapter;

/// Folder id Drive uses for "My Drive".
pub const MY_DRIVE_ROOT: &str = "root";

/// Create a Google Drive adapter. The root scope is the folder id the
/// source is confined to; empty means "My Drive".
pub fn create_gdrive_adapter(
    config: &AdapterConfig,
    credentials: Arc<dyn CredentialSource>,
) -> Result<Arc<dyn StorageAdapter>> {
    let root = if config.root_scope.is_empty() {
        MY_DRIVE_ROOT.to_string()
    } else {
        config.root_scope.clone()
    };
    let client = DriveClient::new(credentials)?;
    Ok(Arc::new(GDriveAdapter::new(root, client)))
}
