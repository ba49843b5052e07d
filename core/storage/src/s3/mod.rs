//! S3-compatible object storage adapter.
//!
//! Works against AWS S3 and compatible stores (MinIO, R2, Wasabi, ...):
//! - path-style or virtual-hosted addressing
//! - SigV4 header signing and presigned share URLs
//! - independent multipart parts with ETag-based completion
//! - folders emulated with delimiter listings and `key/` marker objects

pub mod client;
pub mod provider;
pub mod sigv4;
pub mod xml;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use storegate_common::Result;

use crate::provider::{CredentialSource, StorageAdapter};
use crate::registry::AdapterConfig;

pub use client::S3Client;
pub use provider::S3Adapter;

/// Provider settings for an S3-compatible source. The bucket is the source's root scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    /// Custom endpoint; AWS regional endpoint when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Address the bucket in the path rather than the host name.
    #[serde(default)]
    pub path_style: bool,
    /// Key prefix inside the bucket the source is confined to.
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            path_style: false,
            prefix: None,
        }
    }
}

/// Create an S3 adapter from a source configuration.
pub fn create_s3_adapter(
    config: &AdapterConfig,
    credentials: Arc<dyn CredentialSource>,
) -> Result<Arc<dyn StorageAdapter>> {
    let settings: S3Settings = config.parse_settings()?;
    let client = S3Client::new(config.root_scope.clone(), settings, credentials)?;
    Ok(Arc::new(S3Adapter::new(client)))
}
