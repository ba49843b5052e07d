//! Credential material handed to adapters.
//!
//! The gateway treats credentials as opaque apart from their expiry; only the
//! adapter for the matching provider looks inside the secret.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SensitiveString;

/// Secret material for one storage source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSecret {
    /// OAuth2 bearer token (OneDrive, Google Drive).
    OAuth {
        access_token: SensitiveString,
        #[serde(default)]
        refresh_token: Option<SensitiveString>,
    },
    /// Static access key pair (S3-compatible stores).
    AccessKey {
        access_key_id: String,
        secret_access_key: SensitiveString,
        #[serde(default)]
        session_token: Option<SensitiveString>,
    },
    /// No authentication (in-memory and public endpoints).
    Anonymous,
}

/// A credential with expiry tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub secret: CredentialSecret,
    /// When the credential stops working. `None` means it does not expire.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Refresh skew: a credential this close to expiry counts as expired.
    pub const EXPIRY_SKEW_SECS: i64 = 300;

    pub fn new(secret: CredentialSecret, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { secret, expires_at }
    }

    pub fn anonymous() -> Self {
        Self::new(CredentialSecret::Anonymous, None)
    }

    /// Check if the credential is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now + Duration::seconds(Self::EXPIRY_SKEW_SECS),
            None => false,
        }
    }

    /// Bearer token, if this is an OAuth credential.
    pub fn bearer_token(&self) -> Option<&str> {
        match &self.secret {
            CredentialSecret::OAuth { access_token, .. } => Some(access_token.expose()),
            _ => None,
        }
    }

    /// Refresh token, if present.
    pub fn refresh_token(&self) -> Option<&str> {
        match &self.secret {
            CredentialSecret::OAuth { refresh_token, .. } => {
                refresh_token.as_ref().map(|t| t.expose())
            }
            _ => None,
        }
    }
}
