//! Provisioning state machine.
//!
//! Consumes provision intents, enforces the one-lab-per-user invariant,
//! writes the cache record, drives the cloud create call, and polls the
//! provider state until the VM is running (or the poll ceiling is hit).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cloud::{CloudDriver, VmHandle};
use crate::config::ControllerConfig;
use crate::domain::{DecommissionIntent, ProvisionIntent, VmRecord};
use crate::rate_limit::{Operation, RateGate};
use crate::store::{
    server_cache_key, Store, StoreError, DECOMMISSION_QUEUE, SERVER_CACHE_TTL,
};

/// Handles provision intents popped from the provision queue.
pub struct Provisioner {
    store: Arc<dyn Store>,
    cloud: Arc<dyn CloudDriver>,
    rate_gate: RateGate,
    ssh_username: String,
    default_ttl: chrono::Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    poll_interval: Duration,
    state_timeout: Duration,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudDriver>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            rate_gate: RateGate::new(Arc::clone(&store), config),
            store,
            cloud,
            ssh_username: config.ssh_username.clone(),
            default_ttl: chrono::Duration::from_std(config.default_ttl())
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            retry_attempts: config.store_retry_attempts,
            retry_delay: config.store_retry_delay(),
            poll_interval: config.poll_interval(),
            state_timeout: config.state_timeout(),
        }
    }

    /// Custom poll interval (useful for testing).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Custom poll ceiling (useful for testing).
    pub fn with_state_timeout(mut self, timeout: Duration) -> Self {
        self.state_timeout = timeout;
        self
    }

    /// Custom store-retry delay (useful for testing).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self.rate_gate = self.rate_gate.with_retry_delay(delay);
        self
    }

    /// Handles a single provision intent from the queue.
    pub async fn handle(&self, cancel: &CancellationToken, payload: &str) {
        let intent = match ProvisionIntent::parse(payload) {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed provision intent");
                return;
            }
        };
        let web_user_id = intent.web_user_id.as_str();
        let lab_id = intent.lab_id;

        match self.rate_gate.admit(web_user_id, Operation::Provision).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    web_user_id = %web_user_id,
                    lab_id,
                    "provision rate limit hit, dropping intent"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    web_user_id = %web_user_id,
                    lab_id,
                    error = %e,
                    "rate-gate check failed after retries, dropping intent"
                );
                return;
            }
        }

        let cache_key = server_cache_key(web_user_id);

        let existing = match self.get_record_with_retry(&cache_key).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!(
                    web_user_id = %web_user_id,
                    lab_id,
                    error = %e,
                    "cache read failed after retries, aborting provision"
                );
                return;
            }
        };

        if let Some(existing) = existing {
            if existing.lab_id == lab_id {
                tracing::info!(
                    web_user_id = %web_user_id,
                    lab_id,
                    server_id = %existing.server_id,
                    status = %existing.status,
                    "lab already provisioned, ignoring duplicate intent"
                );
                return;
            }

            // Lab switch: queue a decommission for the old VM before the
            // cache line is overwritten below. The old server id rides in
            // the intent so the VM stays deletable afterwards.
            tracing::info!(
                web_user_id = %web_user_id,
                old_lab_id = existing.lab_id,
                new_lab_id = lab_id,
                old_server_id = %existing.server_id,
                "lab switch, queueing decommission of previous vm"
            );
            let decommission =
                DecommissionIntent::lab_switch(web_user_id, existing.lab_id, existing.server_id);
            match serde_json::to_string(&decommission) {
                Ok(payload) => {
                    if let Err(e) = self.store.push_payload(DECOMMISSION_QUEUE, &payload).await {
                        tracing::error!(
                            web_user_id = %web_user_id,
                            error = %e,
                            "failed to queue decommission for previous vm, continuing"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode decommission intent");
                }
            }
        }

        let expires_at = Utc::now() + self.default_ttl;
        let mut record =
            VmRecord::provisioning(self.ssh_username.clone(), web_user_id, lab_id, expires_at);

        if let Err(e) = self
            .store
            .put_record(&cache_key, &record, SERVER_CACHE_TTL)
            .await
        {
            // A missing placeholder is recoverable; provisioning goes ahead.
            tracing::warn!(
                web_user_id = %web_user_id,
                error = %e,
                "failed to cache initial provisioning state, continuing"
            );
        }

        let vm = match self.cloud.create_vm(&intent).await {
            Ok(vm) => vm,
            Err(e) => {
                tracing::error!(
                    web_user_id = %web_user_id,
                    lab_id,
                    error = %e,
                    "vm creation failed"
                );
                if let Err(e) = self.store.delete_record(&cache_key).await {
                    tracing::error!(error = %e, "failed to clear cache after create failure");
                }
                return;
            }
        };
        tracing::info!(
            web_user_id = %web_user_id,
            lab_id,
            server_id = %vm.id(),
            address = %vm.address(),
            "vm created"
        );

        let cloud_state = match vm.poll_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(server_id = %vm.id(), error = %e, "initial state query failed");
                "unknown".to_string()
            }
        };

        record.server_id = vm.id().to_string();
        record.address = vm.address().to_string();
        record.observe_cloud_state(&cloud_state);

        if let Err(e) = self
            .store
            .put_record(&cache_key, &record, SERVER_CACHE_TTL)
            .await
        {
            tracing::error!(server_id = %vm.id(), error = %e, "failed to cache vm state");
        } else {
            tracing::info!(
                server_id = %vm.id(),
                status = %record.status,
                address = %record.address,
                "vm state cached"
            );
        }

        self.poll_server_state(cancel, vm.as_ref(), &cache_key, record, cloud_state)
            .await;
    }

    /// Polls the provider until the VM runs, the ceiling elapses, or the
    /// process shuts down.
    async fn poll_server_state(
        &self,
        cancel: &CancellationToken,
        vm: &dyn VmHandle,
        cache_key: &str,
        mut record: VmRecord,
        initial_state: String,
    ) {
        let server_id = vm.id().to_string();
        let mut last_state = initial_state;

        let deadline = tokio::time::sleep(self.state_timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // interval fires immediately; the first poll waits one period

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(server_id = %server_id, "shutdown requested, stopping state polling");
                    return;
                }
                _ = &mut deadline => {
                    tracing::info!(
                        server_id = %server_id,
                        final_state = %last_state,
                        "state polling timeout reached"
                    );
                    return;
                }
                _ = ticker.tick() => {
                    let current = match vm.poll_state().await {
                        Ok(state) => state,
                        Err(e) => {
                            self.fail_provisioning(vm, cache_key, "state poll failed", &e.to_string())
                                .await;
                            return;
                        }
                    };

                    if current != last_state {
                        tracing::info!(
                            server_id = %server_id,
                            old_state = %last_state,
                            new_state = %current,
                            "vm state changed"
                        );
                        record.observe_cloud_state(&current);
                        if let Err(e) = self
                            .store
                            .put_record(cache_key, &record, SERVER_CACHE_TTL)
                            .await
                        {
                            self.fail_provisioning(
                                vm,
                                cache_key,
                                "cache update failed during polling",
                                &e.to_string(),
                            )
                            .await;
                            return;
                        }
                        last_state = current;
                    }

                    if last_state == "running" {
                        tracing::info!(server_id = %server_id, "vm is running, stopping state polling");
                        return;
                    }
                }
            }
        }
    }

    /// Fatal provisioning error: the VM is torn down and the cache cleared
    /// so the user sees a clean slate instead of a wedged record.
    async fn fail_provisioning(&self, vm: &dyn VmHandle, cache_key: &str, what: &str, error: &str) {
        tracing::error!(server_id = %vm.id(), error = %error, "{what}");

        if let Err(e) = vm.delete().await {
            tracing::error!(server_id = %vm.id(), error = %e, "failed to delete vm after error");
        } else {
            tracing::info!(server_id = %vm.id(), "vm deleted after provisioning error");
        }

        if let Err(e) = self.store.delete_record(cache_key).await {
            tracing::error!(server_id = %vm.id(), error = %e, "failed to clear cache after error");
        }
    }

    /// Cache read with bounded retries; a miss is a normal outcome, only
    /// I/O errors are retried.
    async fn get_record_with_retry(&self, cache_key: &str) -> Result<Option<VmRecord>, StoreError> {
        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            match self.store.get_record(cache_key).await {
                Ok(existing) => return Ok(existing),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "cache read failed, retrying"
                    );
                    last_err = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Backend("cache read exhausted".to_string())))
    }
}
