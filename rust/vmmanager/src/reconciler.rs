//! Expiry reconciler.
//!
//! Periodically scans the VM cache and converts records past their
//! `expiresAt` into decommission intents. It never deletes VMs itself; all
//! deletion flows through the decommission queue so ordering per user is
//! preserved and the deletion logic stays in one place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::domain::DecommissionIntent;
use crate::store::{Store, DECOMMISSION_QUEUE, SERVER_CACHE_PREFIX};

/// Periodic sweep turning expired records into decommission intents.
pub struct ExpiryReconciler {
    store: Arc<dyn Store>,
    interval: Duration,
}

impl ExpiryReconciler {
    pub fn new(store: Arc<dyn Store>, config: &ControllerConfig) -> Self {
        Self {
            store,
            interval: config.reconcile_interval(),
        }
    }

    /// Custom sweep interval (useful for testing).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until cancelled. One sweep fires immediately on startup.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("expiry reconciler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("expiry reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep(&cancel).await;
                }
            }
        }
    }

    /// One pass over the cache.
    pub async fn sweep(&self, cancel: &CancellationToken) {
        let records = match self.store.scan_records(SERVER_CACHE_PREFIX).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "cache scan failed, skipping sweep");
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut expired = 0usize;

        for record in records {
            if cancel.is_cancelled() {
                tracing::info!("sweep interrupted, stopping");
                return;
            }
            if !record.is_expired(now) {
                continue;
            }
            expired += 1;

            let intent = DecommissionIntent::expired(&record.web_user_id, record.lab_id);
            let payload = match serde_json::to_string(&intent) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode decommission intent");
                    continue;
                }
            };
            if let Err(e) = self.store.push_payload(DECOMMISSION_QUEUE, &payload).await {
                tracing::error!(
                    web_user_id = %record.web_user_id,
                    server_id = %record.server_id,
                    error = %e,
                    "failed to queue decommission for expired vm"
                );
                continue;
            }
            tracing::info!(
                web_user_id = %record.web_user_id,
                server_id = %record.server_id,
                lab_id = record.lab_id,
                "queued decommission for expired vm"
            );
        }

        if expired > 0 {
            tracing::info!(count = expired, "expiry sweep queued decommissions");
        }
    }
}
