//! Queue dispatch and lifecycle supervision.
//!
//! Owns the three long-lived tasks: the provision worker, the decommission
//! worker, and the expiry reconciler. Each worker blocks on its queue and
//! runs every handler on a fresh task so a slow cloud call never starves the
//! queue pop; handlers in flight are tracked and drained on shutdown.
//!
//! The number of in-flight handlers per queue is unbounded; the rate gate is
//! what bounds work per user, and queue producers are trusted back-pressure.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cloud::CloudDriver;
use crate::config::ControllerConfig;
use crate::decommissioner::Decommissioner;
use crate::provisioner::Provisioner;
use crate::reconciler::ExpiryReconciler;
use crate::store::{Store, StoreError, DECOMMISSION_QUEUE, PROVISION_QUEUE};

/// Wires the queue workers and the reconciler together.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    provisioner: Arc<Provisioner>,
    decommissioner: Arc<Decommissioner>,
    reconciler: Arc<ExpiryReconciler>,
    pop_timeout: Duration,
}

impl Dispatcher {
    /// Builds all components from configuration.
    pub fn from_config(
        store: Arc<dyn Store>,
        cloud: Arc<dyn CloudDriver>,
        config: &ControllerConfig,
    ) -> Self {
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            config,
        ));
        let decommissioner = Arc::new(Decommissioner::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            config,
        ));
        let reconciler = Arc::new(ExpiryReconciler::new(Arc::clone(&store), config));
        Self::new(
            store,
            provisioner,
            decommissioner,
            reconciler,
            config.queue_pop_timeout(),
        )
    }

    /// Assembles a dispatcher from pre-built components.
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<Provisioner>,
        decommissioner: Arc<Decommissioner>,
        reconciler: Arc<ExpiryReconciler>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            decommissioner,
            reconciler,
            pop_timeout,
        }
    }

    /// Runs until `cancel` fires, then waits for in-flight handlers.
    pub async fn run(&self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        tokio::join!(
            self.provision_worker(&cancel, &tracker),
            self.decommission_worker(&cancel, &tracker),
            self.reconciler.run(cancel.clone()),
        );

        tracing::info!("waiting for in-flight handlers to complete");
        tracker.close();
        tracker.wait().await;
        tracing::info!("all handlers completed, dispatcher stopped");
    }

    async fn provision_worker(&self, cancel: &CancellationToken, tracker: &TaskTracker) {
        loop {
            let payload = match self.pop(cancel, PROVISION_QUEUE).await {
                Some(payload) => payload,
                None => {
                    if cancel.is_cancelled() {
                        tracing::info!(queue = PROVISION_QUEUE, "queue worker stopping");
                        return;
                    }
                    continue;
                }
            };

            tracing::info!(
                queue = PROVISION_QUEUE,
                payload_len = payload.len(),
                "received provision intent"
            );
            let provisioner = Arc::clone(&self.provisioner);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                provisioner.handle(&cancel, &payload).await;
            });
        }
    }

    async fn decommission_worker(&self, cancel: &CancellationToken, tracker: &TaskTracker) {
        loop {
            let payload = match self.pop(cancel, DECOMMISSION_QUEUE).await {
                Some(payload) => payload,
                None => {
                    if cancel.is_cancelled() {
                        tracing::info!(queue = DECOMMISSION_QUEUE, "queue worker stopping");
                        return;
                    }
                    continue;
                }
            };

            tracing::info!(
                queue = DECOMMISSION_QUEUE,
                payload_len = payload.len(),
                "received decommission intent"
            );
            let decommissioner = Arc::clone(&self.decommissioner);
            tracker.spawn(async move {
                decommissioner.handle(&payload).await;
            });
        }
    }

    /// One blocking pop, raced against shutdown. The pop timeout gives the
    /// loop periodic opportunities to observe cancellation even on backends
    /// whose blocking pop cannot be interrupted.
    async fn pop(&self, cancel: &CancellationToken, queue: &str) -> Option<String> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.store.pop_payload(queue, self.pop_timeout) => match result {
                Ok(payload) => Some(payload),
                Err(StoreError::Empty) => None,
                Err(e) => {
                    tracing::debug!(queue = queue, error = %e, "queue pop failed");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;
    use crate::domain::VmStatus;
    use crate::store::memory::MemoryStore;
    use crate::store::server_cache_key;

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            provision_rate_limit_secs: 0,
            decommission_rate_limit_secs: 0,
            ..ControllerConfig::default()
        }
    }

    fn dispatcher(store: Arc<MemoryStore>, cloud: Arc<MockCloud>) -> Dispatcher {
        let config = test_config();
        let store_dyn: Arc<dyn Store> = store;
        let cloud_dyn: Arc<dyn CloudDriver> = cloud;
        let provisioner = Arc::new(
            Provisioner::new(Arc::clone(&store_dyn), Arc::clone(&cloud_dyn), &config)
                .with_poll_interval(Duration::from_millis(5))
                .with_state_timeout(Duration::from_millis(500)),
        );
        let decommissioner = Arc::new(Decommissioner::new(
            Arc::clone(&store_dyn),
            Arc::clone(&cloud_dyn),
            &config,
        ));
        let reconciler = Arc::new(
            ExpiryReconciler::new(Arc::clone(&store_dyn), &config)
                .with_interval(Duration::from_millis(20)),
        );
        Dispatcher::new(
            store_dyn,
            provisioner,
            decommissioner,
            reconciler,
            Duration::from_millis(20),
        )
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn dispatcher_processes_both_queues_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloud::new());
        let dispatcher = Arc::new(dispatcher(Arc::clone(&store), Arc::clone(&cloud)));
        let cancel = CancellationToken::new();

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        store
            .push_payload(PROVISION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
            .await
            .unwrap();

        {
            let store = Arc::clone(&store);
            wait_for(move || {
                store
                    .raw_get(&server_cache_key("u1"))
                    .map_or(false, |data| data.contains(r#""status":"running""#))
            })
            .await;
        }
        assert_eq!(cloud.create_count(), 1);

        store
            .push_payload(DECOMMISSION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
            .await
            .unwrap();

        {
            let cloud = Arc::clone(&cloud);
            wait_for(move || cloud.live_vms() == 0).await;
        }
        assert!(store.raw_get(&server_cache_key("u1")).is_none());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("dispatcher drains and stops")
            .unwrap();
    }

    #[tokio::test]
    async fn intents_on_one_queue_are_handled_in_order() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloud::new());
        let dispatcher = Arc::new(dispatcher(Arc::clone(&store), Arc::clone(&cloud)));
        let cancel = CancellationToken::new();

        // Same-lab duplicates behind the first: only one create may happen,
        // which requires the duplicate check to observe the first handler's
        // cache write (FIFO pop order).
        store
            .push_payload(PROVISION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
            .await
            .unwrap();

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        {
            let cloud = Arc::clone(&cloud);
            wait_for(move || cloud.create_count() == 1).await;
        }
        {
            let store = Arc::clone(&store);
            wait_for(move || {
                store
                    .raw_get(&server_cache_key("u1"))
                    .map_or(false, |data| data.contains(r#""status":"running""#))
            })
            .await;
        }

        store
            .push_payload(PROVISION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cloud.create_count(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("dispatcher stops")
            .unwrap();
    }

    #[tokio::test]
    async fn reconciler_path_drains_expired_records() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(MockCloud::new());
        let server_id = cloud.seed_vm("running");
        let mut record =
            crate::domain::VmRecord::provisioning("student", "u1", 5, chrono::Utc::now());
        record.server_id = server_id;
        record.observe_cloud_state("running");
        record.expires_at = chrono::Utc::now() - chrono::Duration::minutes(1);
        store
            .put_record(
                &server_cache_key("u1"),
                &record,
                crate::store::SERVER_CACHE_TTL,
            )
            .await
            .unwrap();
        assert_eq!(record.status, VmStatus::Running);

        let dispatcher = Arc::new(dispatcher(Arc::clone(&store), Arc::clone(&cloud)));
        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        {
            let cloud = Arc::clone(&cloud);
            wait_for(move || cloud.live_vms() == 0).await;
        }
        {
            let store = Arc::clone(&store);
            wait_for(move || store.raw_get(&server_cache_key("u1")).is_none()).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("dispatcher stops")
            .unwrap();
    }
}
