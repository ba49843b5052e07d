//! Gateway configuration.
//!
//! Loaded from a JSON file, then overridden by `STOREGATE_*` environment
//! variables. Every section has defaults, so an empty `{}` is a valid file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use storegate_common::{Error, Result};

use crate::governor::RetryConfig;

/// Per-operation time limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit for one gateway operation, retries included.
    pub operation_ms: u64,
    /// Limit for one source inside a federated listing.
    pub federated_source_ms: u64,
    /// Limit for one transfer part.
    pub transfer_part_ms: u64,
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn federated_source(&self) -> Duration {
        Duration::from_millis(self.federated_source_ms)
    }

    pub fn transfer_part(&self) -> Duration {
        Duration::from_millis(self.transfer_part_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_ms: 30_000,
            federated_source_ms: 10_000,
            transfer_part_ms: 120_000,
        }
    }
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Token bucket defaults for providers that advertise no quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_per_second: f64,
    pub default_burst: u32,
    /// Shards of the in-memory bucket map.
    pub shards: usize,
    /// Idle buckets older than this are dropped on access.
    pub idle_expiry_secs: u64,
    /// SQLite database holding buckets shared by every gateway instance.
    /// Buckets stay in process memory when absent.
    pub shared_store: Option<PathBuf>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_per_second: 10.0,
            default_burst: 20,
            shards: 16,
            idle_expiry_secs: 600,
            shared_store: None,
        }
    }
}

/// Pagination cursor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    pub ttl_secs: u64,
    /// Hex-encoded MAC key shared by every gateway instance. Random per
    /// process when absent, which invalidates cursors on restart.
    pub key_hex: Option<String>,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            key_hex: None,
        }
    }
}

/// Transfer session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Requested part size before provider negotiation.
    pub default_part_size: u64,
    /// Non-terminal sessions idle this long are aborted.
    pub idle_timeout_secs: u64,
    /// Terminal sessions are kept this long before collection.
    pub retention_secs: u64,
    pub janitor_interval_secs: u64,
}

impl TransferSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_part_size: 8 * 1024 * 1024,
            idle_timeout_secs: 24 * 3600,
            retention_secs: 7 * 24 * 3600,
            janitor_interval_secs: 300,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub timeouts: TimeoutConfig,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub cursor: CursorSettings,
    pub transfer: TransferSettings,
}

impl GatewayConfig {
    /// Load from a JSON file and apply environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// - The file exists but cannot be read or parsed
    /// - An override variable holds an unparsable value
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::InvalidInput(format!("Invalid config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(Error::Io(e)),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STOREGATE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid value for {}: {}", name, value)))
        }

        macro_rules! override_with {
            ($name:literal, $field:expr) => {
                if let Some(value) = lookup($name) {
                    $field = parse($name, value)?;
                }
            };
        }

        override_with!("STOREGATE_OPERATION_TIMEOUT_MS", self.timeouts.operation_ms);
        override_with!("STOREGATE_FEDERATED_TIMEOUT_MS", self.timeouts.federated_source_ms);
        override_with!("STOREGATE_PART_TIMEOUT_MS", self.timeouts.transfer_part_ms);
        override_with!("STOREGATE_RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        override_with!("STOREGATE_RETRY_INITIAL_DELAY_MS", self.retry.initial_delay_ms);
        override_with!("STOREGATE_CURSOR_TTL_SECS", self.cursor.ttl_secs);
        override_with!("STOREGATE_PART_SIZE", self.transfer.default_part_size);
        override_with!("STOREGATE_TRANSFER_IDLE_SECS", self.transfer.idle_timeout_secs);

        if let Some(key) = lookup("STOREGATE_CURSOR_KEY") {
            self.cursor.key_hex = Some(key);
        }
        if let Some(path) = lookup("STOREGATE_RATE_LIMIT_DB") {
            self.rate_limit.shared_store = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.default_per_second <= 0.0 || self.rate_limit.default_burst == 0 {
            return Err(Error::InvalidInput(
                "rate_limit defaults must be positive".to_string(),
            ));
        }
        if self.timeouts.operation_ms == 0 || self.cursor.ttl_secs == 0 {
            return Err(Error::InvalidInput(
                "timeouts and cursor TTL must be positive".to_string(),
            ));
        }
        if self.transfer.default_part_size == 0 {
            return Err(Error::InvalidInput(
                "transfer.default_part_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_json_is_default() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cursor.ttl_secs, 600);
    }

    #[test]
    fn test_partial_section() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"timeouts": {"operation_ms": 5000}}"#).unwrap();
        assert_eq!(config.timeouts.operation(), Duration::from_secs(5));
        assert_eq!(config.timeouts.federated_source_ms, 10_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STOREGATE_OPERATION_TIMEOUT_MS", "1500"),
            ("STOREGATE_RETRY_MAX_ATTEMPTS", "3"),
            ("STOREGATE_CURSOR_KEY", "00ff"),
            ("STOREGATE_RATE_LIMIT_DB", "/var/lib/storegate/buckets.db"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.timeouts.operation_ms, 1500);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cursor.key_hex.as_deref(), Some("00ff"));
        assert_eq!(
            config.rate_limit.shared_store,
            Some(PathBuf::from("/var/lib/storegate/buckets.db"))
        );
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = GatewayConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "STOREGATE_PART_SIZE").then(|| "big".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config.transfer.default_part_size, 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        tokio::fs::write(&path, r#"{"transfer": {"default_part_size": 1048576}}"#)
            .await
            .unwrap();
        let config = GatewayConfig::load(&path).await.unwrap();
        assert_eq!(config.transfer.default_part_size, 1_048_576);
    }
}
