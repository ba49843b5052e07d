//! Shared HTTP plumbing for the remote adapters.
//!
//! Every remote adapter funnels responses through [`classify_status`], so the
//! mapping from HTTP failures to the common taxonomy lives in one place.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::sync::Mutex;
use std::time::Duration;

use storegate_common::{Credential, Error, Result};

use crate::provider::{CredentialSource, RateLimitSignal};

/// User agent sent with every provider request.
pub const USER_AGENT: &str = "Storegate/0.1";

/// Build the HTTP client shared by an adapter instance.
pub fn build_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::Unknown(format!("Failed to create HTTP client: {}", e)))
}

/// Map a transport error (no response received) onto the taxonomy.
pub fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// `Retry-After` from a response, if present and parseable.
pub fn retry_after_header(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Classify an unsuccessful HTTP status and body.
///
/// Providers disagree on how they report throttling and quota exhaustion:
/// Google uses 403 with a reason code, S3 uses 503 SlowDown, Graph uses 429.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    context: &str,
) -> Error {
    let message = if body.is_empty() {
        format!("{}: {}", context, status)
    } else {
        format!("{}: {} - {}", context, status, truncate(body, 512))
    };

    match status.as_u16() {
        404 | 410 => Error::NotFound(message),
        401 => Error::Authentication(message),
        403 => {
            if contains_any(body, &["rateLimitExceeded", "userRateLimitExceeded", "SlowDown"]) {
                Error::Throttled {
                    message,
                    retry_after,
                }
            } else if contains_any(
                body,
                &["storageQuotaExceeded", "quotaLimitReached", "QuotaExceeded"],
            ) {
                Error::QuotaExceeded(message)
            } else {
                Error::PermissionDenied(message)
            }
        }
        409 | 412 | 423 => Error::Conflict(message),
        429 => Error::Throttled {
            message,
            retry_after,
        },
        503 if retry_after.is_some() || body.contains("SlowDown") => Error::Throttled {
            message,
            retry_after,
        },
        507 => Error::QuotaExceeded(message),
        500..=599 => Error::Unavailable(message),
        400 => Error::InvalidInput(message),
        _ => Error::Unknown(message),
    }
}

/// Consume an unsuccessful response and classify it.
pub async fn error_from_response(response: Response, context: &str) -> Error {
    let status = response.status();
    let retry_after = retry_after_header(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify_status(status, retry_after, &body, context)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Holds the latest throttle signal an adapter observed.
#[derive(Default)]
pub struct RateSignalCell {
    inner: Mutex<Option<RateLimitSignal>>,
}

impl RateSignalCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the signal carried by an error, if any.
    pub fn observe(&self, err: &Error) {
        if let Some(retry_after) = err.retry_after() {
            let mut slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            *slot = Some(RateLimitSignal::new(retry_after));
        }
    }

    /// Latest signal that has not yet elapsed.
    pub fn current(&self) -> Option<RateLimitSignal> {
        let mut slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match *slot {
            Some(signal) if signal.remaining().is_some() => Some(signal),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }
}

/// Bearer token from an OAuth credential.
pub fn bearer(credential: &Credential) -> Result<String> {
    credential
        .bearer_token()
        .map(|t| format!("Bearer {}", t))
        .ok_or_else(|| Error::Authentication("OAuth credential required".to_string()))
}

/// Send a bearer-authorized request, refreshing once if the provider rejects the token.
///
/// `build` is invoked once per attempt with the `Authorization` header value.
pub async fn send_authorized<F>(
    credentials: &dyn CredentialSource,
    context: &str,
    build: F,
) -> Result<Response>
where
    F: Fn(&str) -> RequestBuilder,
{
    let credential = credentials.credential().await?;
    let auth = bearer(&credential)?;

    let response = build(&auth)
        .send()
        .await
        .map_err(|e| transport_error(context, e))?;

    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    tracing::debug!(context, "Provider rejected access token, refreshing");
    let refreshed = credentials.refresh_after_rejection(&credential).await?;
    let auth = bearer(&refreshed)?;

    build(&auth)
        .send()
        .await
        .map_err(|e| transport_error(context, e))
}

/// Check a response for success, classifying failures.
pub async fn ensure_success(response: Response, context: &str) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(response, context).await)
    }
}

/// Deserialize a successful JSON response, classifying failures.
pub async fn json_response<T: serde::de::DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T> {
    let response = ensure_success(response, context).await?;
    response
        .json()
        .await
        .map_err(|e| Error::Serialization(format!("{}: failed to parse response: {}", context, e)))
}
