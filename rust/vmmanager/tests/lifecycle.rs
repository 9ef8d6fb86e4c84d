//! End-to-end lifecycle scenarios over the in-memory store and the scripted
//! cloud driver: provision to readiness, lab switching, duplicate collapse,
//! stale decommissions, cache-less orphan deletion, and the expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use vmmanager::cloud::{CloudDriver, MockCloud};
use vmmanager::config::ControllerConfig;
use vmmanager::decommissioner::Decommissioner;
use vmmanager::domain::{DecommissionIntent, VmRecord, VmStatus};
use vmmanager::provisioner::Provisioner;
use vmmanager::reconciler::ExpiryReconciler;
use vmmanager::store::memory::MemoryStore;
use vmmanager::store::{
    server_cache_key, Store, StoreError, DECOMMISSION_QUEUE, SERVER_CACHE_TTL,
};

/// Test rig wiring the control-plane components against in-memory fakes.
///
/// Queue traffic is orchestrated explicitly (pop, then handle) so each
/// scenario is deterministic; dispatcher-driven concurrency is covered by
/// the dispatcher's own tests.
struct Lab {
    store: Arc<MemoryStore>,
    cloud: Arc<MockCloud>,
    provisioner: Provisioner,
    decommissioner: Decommissioner,
    reconciler: ExpiryReconciler,
    cancel: CancellationToken,
}

impl Lab {
    fn new() -> Self {
        Self::with_cloud(MockCloud::new())
    }

    fn with_cloud(cloud: MockCloud) -> Self {
        let config = ControllerConfig {
            provision_rate_limit_secs: 0,
            decommission_rate_limit_secs: 0,
            ..ControllerConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(cloud);
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let cloud_dyn: Arc<dyn CloudDriver> = Arc::clone(&cloud) as Arc<dyn CloudDriver>;

        Self {
            provisioner: Provisioner::new(
                Arc::clone(&store_dyn),
                Arc::clone(&cloud_dyn),
                &config,
            )
            .with_poll_interval(Duration::from_millis(5))
            .with_state_timeout(Duration::from_millis(500)),
            decommissioner: Decommissioner::new(
                Arc::clone(&store_dyn),
                Arc::clone(&cloud_dyn),
                &config,
            ),
            reconciler: ExpiryReconciler::new(Arc::clone(&store_dyn), &config)
                .with_interval(Duration::from_millis(10)),
            store,
            cloud,
            cancel: CancellationToken::new(),
        }
    }

    async fn provision(&self, payload: &str) {
        self.provisioner.handle(&self.cancel, payload).await;
    }

    /// Pops and handles decommission intents until the queue is empty.
    async fn drain_decommissions(&self) {
        loop {
            match self
                .store
                .pop_payload(DECOMMISSION_QUEUE, Duration::from_millis(5))
                .await
            {
                Ok(payload) => self.decommissioner.handle(&payload).await,
                Err(StoreError::Empty) => return,
                Err(e) => panic!("unexpected store error: {e}"),
            }
        }
    }

    async fn record(&self, user: &str) -> Option<VmRecord> {
        self.store
            .get_record(&server_cache_key(user))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn first_time_provision_reaches_running() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;

    let record = lab.record("u1").await.expect("record cached");
    assert_eq!(record.status, VmStatus::Running);
    assert!(record.available);
    assert_eq!(record.lab_id, 5);
    assert!(!record.address.is_empty());
    assert!(!record.server_id.is_empty());
    assert_eq!(lab.cloud.live_vms(), 1);
}

#[tokio::test]
async fn lab_switch_replaces_record_and_reclaims_old_vm() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let old = lab.record("u1").await.unwrap();

    lab.provision(r#"{"webuserid":"u1","labId":7}"#).await;

    // The synthetic decommission intent names the old lab and server.
    assert_eq!(lab.store.queue_len(DECOMMISSION_QUEUE), 1);
    let new = lab.record("u1").await.unwrap();
    assert_eq!(new.lab_id, 7);
    assert_ne!(new.server_id, old.server_id);
    assert_eq!(lab.cloud.live_vms(), 2);

    lab.drain_decommissions().await;

    // Old VM reclaimed; the new lab is untouched.
    assert_eq!(lab.cloud.live_vms(), 1);
    assert!(lab.cloud.get_vm(&old.server_id).await.is_err());
    let record = lab.record("u1").await.unwrap();
    assert_eq!(record.lab_id, 7);
    assert_eq!(record.status, VmStatus::Running);
}

#[tokio::test]
async fn duplicate_provision_makes_no_cloud_calls() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let before = lab.record("u1").await.unwrap();
    assert_eq!(lab.cloud.create_count(), 1);

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;

    assert_eq!(lab.cloud.create_count(), 1);
    assert_eq!(lab.record("u1").await.unwrap(), before);
}

#[tokio::test]
async fn round_trip_returns_to_zero() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    assert_eq!(lab.cloud.live_vms(), 1);

    lab.store
        .push_payload(DECOMMISSION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
        .await
        .unwrap();
    lab.drain_decommissions().await;

    assert_eq!(lab.cloud.live_vms(), 0);
    assert_eq!(lab.record("u1").await, None);
}

#[tokio::test]
async fn stale_decommission_is_ignored() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    lab.provision(r#"{"webuserid":"u1","labId":7}"#).await;
    lab.drain_decommissions().await;
    let settled = lab.record("u1").await.unwrap();
    let deletes = lab.cloud.delete_count();

    // A late duplicate of the lab-5 stop, without a server id.
    lab.store
        .push_payload(DECOMMISSION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
        .await
        .unwrap();
    lab.drain_decommissions().await;

    assert_eq!(lab.record("u1").await.unwrap(), settled);
    assert_eq!(lab.cloud.delete_count(), deletes);
    assert_eq!(lab.cloud.live_vms(), 1);
}

#[tokio::test]
async fn cacheless_decommission_deletes_orphan_vm() {
    let lab = Lab::new();
    let orphan = lab.cloud.seed_vm("running");

    let payload = format!(r#"{{"webuserid":"u1","serverId":"{orphan}"}}"#);
    lab.store
        .push_payload(DECOMMISSION_QUEUE, &payload)
        .await
        .unwrap();
    lab.drain_decommissions().await;

    assert_eq!(lab.cloud.live_vms(), 0);
    assert_eq!(lab.record("u1").await, None);
}

#[tokio::test]
async fn idempotent_decommission_by_server_id() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let server_id = lab.record("u1").await.unwrap().server_id;

    let payload = format!(r#"{{"webuserid":"u1","labId":5,"serverId":"{server_id}"}}"#);
    lab.store
        .push_payload(DECOMMISSION_QUEUE, &payload)
        .await
        .unwrap();
    lab.store
        .push_payload(DECOMMISSION_QUEUE, &payload)
        .await
        .unwrap();
    lab.drain_decommissions().await;

    assert_eq!(lab.cloud.live_vms(), 0);
    assert_eq!(lab.cloud.delete_count(), 1);
    assert_eq!(lab.record("u1").await, None);
}

#[tokio::test]
async fn expiry_sweep_reclaims_abandoned_vm() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let mut record = lab.record("u1").await.unwrap();
    record.expires_at = Utc::now() - chrono::Duration::minutes(1);
    lab.store
        .put_record(&server_cache_key("u1"), &record, SERVER_CACHE_TTL)
        .await
        .unwrap();

    lab.reconciler.sweep(&lab.cancel).await;

    let queued = lab
        .store
        .pop_payload(DECOMMISSION_QUEUE, Duration::from_millis(5))
        .await
        .unwrap();
    let intent = DecommissionIntent::parse(&queued).unwrap();
    assert_eq!(intent.web_user_id, "u1");
    assert_eq!(intent.lab_id, Some(5));
    lab.decommissioner.handle(&queued).await;

    assert_eq!(lab.cloud.live_vms(), 0);
    assert_eq!(lab.record("u1").await, None);
}

#[tokio::test]
async fn fresh_record_survives_the_sweep() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    lab.reconciler.sweep(&lab.cancel).await;

    assert_eq!(lab.store.queue_len(DECOMMISSION_QUEUE), 0);
    assert_eq!(lab.cloud.live_vms(), 1);
    assert!(lab.record("u1").await.is_some());
}

#[tokio::test]
async fn users_are_isolated() {
    let lab = Lab::new();

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    lab.provision(r#"{"webuserid":"u2","labId":5}"#).await;
    assert_eq!(lab.cloud.live_vms(), 2);

    lab.store
        .push_payload(DECOMMISSION_QUEUE, r#"{"webuserid":"u1","labId":5}"#)
        .await
        .unwrap();
    lab.drain_decommissions().await;

    assert_eq!(lab.record("u1").await, None);
    let other = lab.record("u2").await.expect("u2 untouched");
    assert_eq!(other.status, VmStatus::Running);
    assert_eq!(lab.cloud.live_vms(), 1);
}

#[tokio::test]
async fn provision_failure_then_recovery_leaves_no_leaks() {
    let lab = Lab::new();
    lab.cloud.fail_next_creates(1);

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    assert_eq!(lab.record("u1").await, None);
    assert_eq!(lab.cloud.live_vms(), 0);

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let record = lab.record("u1").await.unwrap();
    assert_eq!(record.status, VmStatus::Running);
    assert_eq!(lab.cloud.live_vms(), 1);
}

#[tokio::test]
async fn slow_boot_is_finished_by_a_later_sweep() {
    // VM never reaches running inside the poll ceiling; the record lingers
    // and, once expired, the sweep reclaims the VM.
    let lab = Lab::with_cloud(MockCloud::new().with_script(["initializing", "starting"]));

    lab.provision(r#"{"webuserid":"u1","labId":5}"#).await;
    let mut record = lab.record("u1").await.expect("record remains after timeout");
    assert_eq!(record.status, VmStatus::Provisioning);
    assert_eq!(lab.cloud.live_vms(), 1);

    record.expires_at = Utc::now() - chrono::Duration::minutes(1);
    lab.store
        .put_record(&server_cache_key("u1"), &record, SERVER_CACHE_TTL)
        .await
        .unwrap();

    lab.reconciler.sweep(&lab.cancel).await;
    lab.drain_decommissions().await;

    assert_eq!(lab.cloud.live_vms(), 0);
    assert_eq!(lab.record("u1").await, None);
}
