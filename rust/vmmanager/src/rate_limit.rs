//! Per-user, per-operation admission gate.
//!
//! Duplicate intents (front-end retries, double clicks) are the dominant
//! source of wasted cloud work, so admission is a single-shot lock per
//! `(user, operation)` window: the first intent in a window proceeds, the
//! rest are dropped outright rather than queued or deferred.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ControllerConfig;
use crate::store::{rate_limit_key, Store, StoreError};

/// The two gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Provision,
    Decommission,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Decommission => "decommission",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission gate backed by the store's atomic single-shot lock.
pub struct RateGate {
    store: Arc<dyn Store>,
    provision_ttl: Duration,
    decommission_ttl: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl RateGate {
    pub fn new(store: Arc<dyn Store>, config: &ControllerConfig) -> Self {
        Self {
            store,
            provision_ttl: config.provision_rate_ttl(),
            decommission_ttl: config.decommission_rate_ttl(),
            retry_attempts: config.store_retry_attempts,
            retry_delay: config.store_retry_delay(),
        }
    }

    /// Shrinks the store-retry delay; used by tests.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Tries to admit one `operation` for `web_user_id`.
    ///
    /// `Ok(true)` means the caller holds the window and proceeds; `Ok(false)`
    /// means another operation of this kind was already admitted within the
    /// window and the intent must be dropped. Store failures are retried a
    /// bounded number of times before surfacing.
    pub async fn admit(&self, web_user_id: &str, operation: Operation) -> Result<bool, StoreError> {
        let key = rate_limit_key(web_user_id, operation.as_str());
        let ttl = match operation {
            Operation::Provision => self.provision_ttl,
            Operation::Decommission => self.decommission_ttl,
        };

        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            match self.store.try_acquire(&key, ttl).await {
                Ok(acquired) => return Ok(acquired),
                Err(e) => {
                    tracing::warn!(
                        web_user_id = %web_user_id,
                        operation = %operation,
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "rate-gate check failed, retrying"
                    );
                    last_err = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Backend("rate gate exhausted".to_string())))
    }
}
