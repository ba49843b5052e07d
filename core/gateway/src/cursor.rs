//! Pagination cursors.
//!
//! A cursor wraps a provider-native continuation token together with the
//! source and operation signature it was issued for, an expiry, and a keyed
//! BLAKE2b tag. Encoded as `base64url(payload).base64url(tag)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use blake2::digest::{consts::U32, Mac};
use blake2::Blake2bMac;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use storegate_common::{Error, LogicalPath, Result, SourceId};

type CursorMac = Blake2bMac<U32>;

/// MAC key length in bytes.
pub const KEY_LEN: usize = 32;

/// Default cursor lifetime.
pub const DEFAULT_TTL_SECS: i64 = 600;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    #[serde(rename = "s")]
    source_id: String,
    #[serde(rename = "g")]
    signature: String,
    #[serde(rename = "t")]
    native_token: String,
    /// Expiry, unix seconds.
    #[serde(rename = "e")]
    expires_at: i64,
}

/// Signature of a folder listing: the path plus any filter.
pub fn list_signature(path: &LogicalPath, filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!("list:{}?{}", path, filter),
        None => format!("list:{}", path),
    }
}

/// Issues and verifies cursors.
pub struct CursorManager {
    key: [u8; KEY_LEN],
    ttl: Duration,
}

impl CursorManager {
    pub fn new(key: [u8; KEY_LEN], ttl: std::time::Duration) -> Self {
        Self {
            key,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(DEFAULT_TTL_SECS)),
        }
    }

    /// Manager with a fresh random key.
    pub fn random(ttl: std::time::Duration) -> Self {
        Self::new(rand::random::<[u8; KEY_LEN]>(), ttl)
    }

    /// Manager keyed from a hex string shared between instances.
    ///
    /// # Errors
    /// - `InvalidInput` if the key is not 32 hex-encoded bytes
    pub fn from_hex_key(key_hex: &str, ttl: std::time::Duration) -> Result<Self> {
        let bytes = decode_hex(key_hex.trim())
            .ok_or_else(|| Error::InvalidInput("Cursor key is not valid hex".to_string()))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidInput(format!("Cursor key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self::new(key, ttl))
    }

    fn mac(&self) -> Result<CursorMac> {
        <CursorMac as Mac>::new_from_slice(&self.key)
            .map_err(|e| Error::Unknown(format!("Invalid cursor key: {}", e)))
    }

    /// Wrap a native token for later replay against `source_id` and `signature`.
    pub fn issue(&self, source_id: &SourceId, signature: &str, native_token: &str) -> Result<String> {
        self.issue_at(source_id, signature, native_token, Utc::now())
    }

    fn issue_at(
        &self,
        source_id: &SourceId,
        signature: &str,
        native_token: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let payload = CursorPayload {
            source_id: source_id.as_str().to_string(),
            signature: signature.to_string(),
            native_token: native_token.to_string(),
            expires_at: (now + self.ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&payload)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Recover the native token.
    ///
    /// # Errors
    /// - `InvalidCursor` on malformed encoding, a bad tag, a different source
    ///   or signature, or an elapsed TTL
    pub fn resolve(&self, cursor: &str, source_id: &SourceId, signature: &str) -> Result<String> {
        self.resolve_at(cursor, source_id, signature, Utc::now())
    }

    fn resolve_at(
        &self,
        cursor: &str,
        source_id: &SourceId,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let invalid = |reason: &str| Error::InvalidCursor(reason.to_string());

        let (payload, tag) = cursor.split_once('.').ok_or_else(|| invalid("malformed cursor"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| invalid("malformed cursor"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| invalid("malformed cursor"))?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&tag)
            .map_err(|_| invalid("cursor integrity check failed"))?;

        let payload: CursorPayload =
            serde_json::from_slice(&payload).map_err(|_| invalid("malformed cursor"))?;

        if payload.source_id != source_id.as_str() {
            return Err(invalid("cursor was issued for another source"));
        }
        if payload.signature != signature {
            return Err(invalid("cursor was issued for another listing"));
        }
        if payload.expires_at <= now.timestamp() {
            return Err(invalid("cursor expired"));
        }
        Ok(payload.native_token)
    }
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| value.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}
