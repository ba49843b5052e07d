//! Per-call context supplied by the session layer.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use storegate_common::UserId;

/// Who is calling, and how long they are willing to wait.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: UserId,
    /// Cancelling aborts the in-flight adapter call.
    pub cancel: CancellationToken,
    /// Overrides the configured operation timeout.
    pub timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
