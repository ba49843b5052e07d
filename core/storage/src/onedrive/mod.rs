//! OneDrive storage adapter over Microsoft Graph.
//!
//! Items are addressed by path (`root:/a/b:`), listings page through
//! `@odata.nextLink`, and large files go through upload sessions in
//! 320 KiB aligned fragments.

pub mod client;
pub mod provider;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use storegate_common::Result;

use crate::provider::{CredentialSource, StorageAdapter};
use crate::registry::AdapterConfig;

pub use client::GraphClient;
pub use provider::OneDriveAdapter;

/// Provider settings for a OneDrive source. The drive id is the root scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneDriveSettings {
    /// Graph endpoint, for national clouds.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    client::GRAPH_API_BASE.to_string()
}

impl Default for OneDriveSettings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
        }
    }
}

/// Create a OneDrive adapter from a source configuration.
pub fn create_onedrive_adapter(
    config: &AdapterConfig,
    credentials: Arc<dyn CredentialSource>,
) -> Result<Arc<dyn StorageAdapter>> {
    let settings: OneDriveSettings = config.parse_settings()?;
    let client = GraphClient::new(settings.api_base, &config.root_scope, credentials)?;
    Ok(Arc::new(OneDriveAdapter::new(client)))
}
