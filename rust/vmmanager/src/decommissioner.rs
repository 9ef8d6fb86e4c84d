//! Decommissioning state machine.
//!
//! Consumes decommission intents, validates them against the cache, deletes
//! the VM at the provider, and clears the cache entry. Two degraded paths
//! keep orphans deletable: a cache miss with a supplied server id, and a
//! lab-id mismatch with a supplied server id (the cache has moved on to a
//! newer lab; the old VM is deleted without touching the cache).

use std::sync::Arc;
use std::time::Duration;

use crate::cloud::CloudDriver;
use crate::config::ControllerConfig;
use crate::domain::{DecommissionIntent, VmRecord, VmStatus};
use crate::rate_limit::{Operation, RateGate};
use crate::store::{server_cache_key, Store, SERVER_CACHE_TTL};

/// Handles decommission intents popped from the decommission queue.
pub struct Decommissioner {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudDriver>,
    rate_gate: RateGate,
}

impl Decommissioner {
    pub fn new(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudDriver>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            rate_gate: RateGate::new(Arc::clone(&store), config),
            store,
            cloud,
        }
    }

    /// Custom store-retry delay (useful for testing).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.rate_gate = self.rate_gate.with_retry_delay(delay);
        self
    }

    /// Handles a single decommission intent from the queue.
    pub async fn handle(&self, payload: &str) {
        let intent = match DecommissionIntent::parse(payload) {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed decommission intent");
                return;
            }
        };
        let web_user_id = intent.web_user_id.as_str();

        match self
            .rate_gate
            .admit(web_user_id, Operation::Decommission)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    web_user_id = %web_user_id,
                    lab_id = ?intent.lab_id,
                    "decommission rate limit hit, dropping intent"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    web_user_id = %web_user_id,
                    error = %e,
                    "rate-gate check failed after retries, dropping intent"
                );
                return;
            }
        }

        let cache_key = server_cache_key(web_user_id);

        // A read failure is handled like a miss: with a server id in hand the
        // VM is still deletable, and without one the reconciler re-emits.
        let record = match self.store.get_record(&cache_key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(web_user_id = %web_user_id, error = %e, "cache read failed");
                None
            }
        };

        let Some(record) = record else {
            if let Some(server_id) = intent.server_id.as_deref() {
                tracing::info!(
                    web_user_id = %web_user_id,
                    server_id = %server_id,
                    "vm not in cache, deleting by server id"
                );
                self.delete_by_server_id(server_id).await;
            } else {
                tracing::warn!(
                    web_user_id = %web_user_id,
                    "vm not in cache and no server id supplied, nothing to do"
                );
            }
            return;
        };

        if let Some(lab_id) = intent.lab_id {
            if record.lab_id != lab_id {
                // The cache already belongs to a newer lab.
                if let Some(server_id) = intent.server_id.as_deref() {
                    tracing::info!(
                        web_user_id = %web_user_id,
                        requested_lab_id = lab_id,
                        current_lab_id = record.lab_id,
                        server_id = %server_id,
                        "lab id mismatch, deleting old vm by server id"
                    );
                    self.delete_by_server_id(server_id).await;
                } else {
                    tracing::warn!(
                        web_user_id = %web_user_id,
                        requested_lab_id = lab_id,
                        current_lab_id = record.lab_id,
                        "lab id mismatch, ignoring stale decommission intent"
                    );
                }
                return;
            }
        }

        self.delete_cached_vm(&cache_key, record).await;
        tracing::info!(web_user_id = %web_user_id, "decommission completed");
    }

    /// Deletes the VM named by the cache record, then the record itself.
    ///
    /// The cache entry survives delete failures on purpose: the reconciler
    /// picks the record up again on its next sweep.
    async fn delete_cached_vm(&self, cache_key: &str, mut record: VmRecord) {
        let server_id = record.server_id.clone();

        record.status = VmStatus::Stopping;
        record.available = false;
        record.cloud_status = "stopping".to_string();
        if let Err(e) = self
            .store
            .put_record(cache_key, &record, SERVER_CACHE_TTL)
            .await
        {
            tracing::warn!(server_id = %server_id, error = %e, "failed to mark vm as stopping");
        }

        let vm = match self.cloud.get_vm(&server_id).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => {
                tracing::info!(server_id = %server_id, "vm already gone, clearing cache");
                self.clear_cache(cache_key, &server_id).await;
                return;
            }
            Err(e) => {
                tracing::error!(
                    server_id = %server_id,
                    error = %e,
                    "vm lookup failed, leaving cache for the reconciler"
                );
                return;
            }
        };

        match vm.delete().await {
            Ok(()) => {
                self.clear_cache(cache_key, &server_id).await;
                tracing::info!(server_id = %server_id, "vm decommissioned and removed from cache");
            }
            Err(e) if e.is_not_found() => {
                self.clear_cache(cache_key, &server_id).await;
                tracing::info!(server_id = %server_id, "vm was already deleted, cache cleared");
            }
            Err(e) => {
                tracing::error!(
                    server_id = %server_id,
                    error = %e,
                    "vm delete failed, leaving cache for the reconciler"
                );
            }
        }
    }

    /// Cache-less deletion by provider handle. Used when the cache entry was
    /// overwritten or never existed; the cache is deliberately untouched.
    async fn delete_by_server_id(&self, server_id: &str) {
        let vm = match self.cloud.get_vm(server_id).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => {
                tracing::info!(server_id = %server_id, "vm already gone");
                return;
            }
            Err(e) => {
                tracing::error!(server_id = %server_id, error = %e, "vm lookup failed, abandoning");
                return;
            }
        };

        match vm.delete().await {
            Ok(()) => {
                tracing::info!(server_id = %server_id, "vm deleted by server id");
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(server_id = %server_id, "vm was already deleted");
            }
            Err(e) => {
                tracing::error!(server_id = %server_id, error = %e, "vm delete failed, abandoning");
            }
        }
    }

    async fn clear_cache(&self, cache_key: &str, server_id: &str) {
        if let Err(e) = self.store.delete_record(cache_key).await {
            tracing::error!(
                server_id = %server_id,
                error = %e,
                "failed to remove vm from cache"
            );
        }
    }
}
