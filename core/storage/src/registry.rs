//! Adapter registry for resolving a provider kind to an adapter instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use storegate_common::{Error, ProviderKind, Result, SourceId};

use crate::provider::{CredentialSource, StorageAdapter};

/// Everything an adapter factory needs besides credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub source_id: SourceId,
    /// Bucket, drive id or root folder id the source is scoped to.
    pub root_scope: String,
    /// Provider-specific settings (endpoint, region, ...).
    #[serde(default)]
    pub settings: Value,
}

impl AdapterConfig {
    pub fn new(source_id: SourceId, root_scope: impl Into<String>) -> Self {
        Self {
            source_id,
            root_scope: root_scope.into(),
            settings: Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Deserialize the provider-specific settings, treating null as defaults.
    pub fn parse_settings<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone()).map_err(|e| {
            Error::InvalidInput(format!(
                "Invalid settings for source {}: {}",
                self.source_id, e
            ))
        })
    }
}

/// Factory function type for creating adapters.
pub type AdapterFactory = Box<
    dyn Fn(&AdapterConfig, Arc<dyn CredentialSource>) -> Result<Arc<dyn StorageAdapter>>
        + Send
        + Sync,
>;

/// Registry for storage adapter factories.
///
/// Adding a provider means registering one more factory; the gateway never
/// matches on provider kinds itself.
pub struct AdapterRegistry {
    factories: HashMap<ProviderKind, AdapterFactory>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an adapter factory.
    ///
    /// # Errors
    /// - `Conflict` if the kind is already registered
    pub fn register(&mut self, kind: ProviderKind, factory: AdapterFactory) -> Result<()> {
        if self.factories.contains_key(&kind) {
            return Err(Error::Conflict(format!(
                "Adapter '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Build an adapter for a source.
    ///
    /// # Errors
    /// - `NotFound` if no factory is registered for the kind
    /// - `InvalidInput` if the settings are invalid for the provider
    pub fn create(
        &self,
        kind: ProviderKind,
        config: &AdapterConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Arc<dyn StorageAdapter>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            Error::NotFound(format!("Adapter '{}' is not registered", kind))
        })?;
        factory(config, credentials)
    }

    /// Registered provider kinds.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.factories.keys().copied().collect()
    }

    pub fn has_kind(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with every built-in adapter.
pub fn create_default_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();

    registry.factories.insert(
        ProviderKind::Memory,
        Box::new(|_config, _credentials| Ok(Arc::new(crate::memory::MemoryAdapter::new()))),
    );
    registry.factories.insert(
        ProviderKind::S3Compatible,
        Box::new(|config, credentials| crate::s3::create_s3_adapter(config, credentials)),
    );
    registry.factories.insert(
        ProviderKind::OneDrive,
        Box::new(|config, credentials| {
            crate::onedrive::create_onedrive_adapter(config, credentials)
        }),
    );
    registry.factories.insert(
        ProviderKind::GoogleDrive,
        Box::new(|config, credentials| crate::gdrive::create_gdrive_adapter(config, credentials)),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;
    use crate::provider::StaticCredentials;
    use storegate_common::Credential;

    fn creds() -> Arc<dyn CredentialSource> {
        Arc::new(StaticCredentials::new(Credential::anonymous()))
    }

    fn config() -> AdapterConfig {
        AdapterConfig::new(SourceId::new("s1").unwrap(), "scope")
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(
                ProviderKind::Memory,
                Box::new(|_, _| Ok(Arc::new(MemoryAdapter::new()))),
            )
            .unwrap();

        let adapter = registry
            .create(ProviderKind::Memory, &config(), creds())
            .unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Memory);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(
                ProviderKind::Memory,
                Box::new(|_, _| Ok(Arc::new(MemoryAdapter::new()))),
            )
            .unwrap();

        let result = registry.register(
            ProviderKind::Memory,
            Box::new(|_, _| Ok(Arc::new(MemoryAdapter::new()))),
        );
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_create_unregistered_fails() {
        let registry = AdapterRegistry::new();
        let result = registry.create(ProviderKind::OneDrive, &config(), creds());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry_has_all_kinds() {
        let registry = create_default_registry();
        for kind in [
            ProviderKind::Memory,
            ProviderKind::S3Compatible,
            ProviderKind::OneDrive,
            ProviderKind::GoogleDrive,
        ] {
            assert!(registry.has_kind(kind), "missing {}", kind);
        }
    }

    #[test]
    fn test_parse_settings_null_is_default() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        struct Settings {
            #[serde(default)]
            region: Option<String>,
        }

        let parsed: Settings = config().parse_settings().unwrap();
        assert_eq!(parsed, Settings::default());

        let bad = config().with_settings(serde_json::json!({"region": 5}));
        assert!(bad.parse_settings::<Settings>().is_err());
    }
}
