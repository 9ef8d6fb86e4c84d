//! Scripted in-memory cloud driver.
//!
//! Every created VM walks a fixed raw-state script, one step per poll, then
//! holds its final state. Failures (create errors, locked deletes) are
//! injectable so the control plane's error paths can be exercised without a
//! provider account.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::ProvisionIntent;

use super::{CloudDriver, CloudError, LockedRetry, VmHandle};

/// Default raw-state progression for a freshly created VM.
const DEFAULT_SCRIPT: &[&str] = &["initializing", "starting", "running"];

struct VmSlot {
    address: String,
    script: Vec<String>,
    script_pos: usize,
}

#[derive(Default)]
struct Counters {
    creates: u64,
    deletes: u64,
}

struct Shared {
    vms: Mutex<std::collections::HashMap<String, VmSlot>>,
    counters: Mutex<Counters>,
    create_failures: Mutex<u32>,
    locked_deletes: Mutex<u32>,
    next_address: Mutex<u64>,
}

/// In-memory [`CloudDriver`].
#[derive(Clone)]
pub struct MockCloud {
    shared: Arc<Shared>,
    script: Vec<String>,
    locked_retry: LockedRetry,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                vms: Mutex::new(std::collections::HashMap::new()),
                counters: Mutex::new(Counters::default()),
                create_failures: Mutex::new(0),
                locked_deletes: Mutex::new(0),
                next_address: Mutex::new(1),
            }),
            script: DEFAULT_SCRIPT.iter().map(|s| s.to_string()).collect(),
            locked_retry: LockedRetry::default(),
        }
    }

    /// Overrides the raw-state script new VMs walk through.
    pub fn with_script<I, S>(mut self, script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = script.into_iter().map(Into::into).collect();
        assert!(!self.script.is_empty(), "state script cannot be empty");
        self
    }

    /// Overrides the locked-delete backoff (tests shrink the delays).
    pub fn with_locked_retry(mut self, retry: LockedRetry) -> Self {
        self.locked_retry = retry;
        self
    }

    /// Makes the next `count` create calls fail.
    pub fn fail_next_creates(&self, count: u32) {
        *self.shared.create_failures.lock() = count;
    }

    /// Makes the next `count` delete attempts fail with a locked error.
    pub fn lock_next_deletes(&self, count: u32) {
        *self.shared.locked_deletes.lock() = count;
    }

    /// Total successful create calls.
    pub fn create_count(&self) -> u64 {
        self.shared.counters.lock().creates
    }

    /// Total successful deletes.
    pub fn delete_count(&self) -> u64 {
        self.shared.counters.lock().deletes
    }

    /// Number of VMs currently alive at the provider.
    pub fn live_vms(&self) -> usize {
        self.shared.vms.lock().len()
    }

    /// Seeds a pre-existing VM (for orphan scenarios). Returns its id.
    pub fn seed_vm(&self, state: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let address = self.allocate_address();
        self.shared.vms.lock().insert(
            id.clone(),
            VmSlot {
                address,
                script: vec![state.to_string()],
                script_pos: 0,
            },
        );
        id
    }

    fn allocate_address(&self) -> String {
        let mut next = self.shared.next_address.lock();
        let address = format!("2001:db8::{:x}", *next);
        *next += 1;
        address
    }
}

#[async_trait]
impl CloudDriver for MockCloud {
    async fn create_vm(&self, intent: &ProvisionIntent) -> Result<Box<dyn VmHandle>, CloudError> {
        {
            let mut failures = self.shared.create_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CloudError::Provider(format!(
                    "create rejected for user {}",
                    intent.web_user_id
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let address = self.allocate_address();
        {
            let mut vms = self.shared.vms.lock();
            vms.insert(
                id.clone(),
                VmSlot {
                    address: address.clone(),
                    script: self.script.clone(),
                    script_pos: 0,
                },
            );
        }
        self.shared.counters.lock().creates += 1;

        Ok(Box::new(MockVm {
            shared: Arc::clone(&self.shared),
            locked_retry: self.locked_retry,
            id,
            address,
        }))
    }

    async fn get_vm(&self, server_id: &str) -> Result<Box<dyn VmHandle>, CloudError> {
        let vms = self.shared.vms.lock();
        let slot = vms
            .get(server_id)
            .ok_or_else(|| CloudError::NotFound(server_id.to_string()))?;
        Ok(Box::new(MockVm {
            shared: Arc::clone(&self.shared),
            locked_retry: self.locked_retry,
            id: server_id.to_string(),
            address: slot.address.clone(),
        }))
    }
}

struct MockVm {
    shared: Arc<Shared>,
    locked_retry: LockedRetry,
    id: String,
    address: String,
}

impl MockVm {
    fn try_delete(&self) -> Result<(), CloudError> {
        {
            let mut locked = self.shared.locked_deletes.lock();
            if *locked > 0 {
                *locked -= 1;
                return Err(CloudError::Locked(self.id.clone()));
            }
        }
        let mut vms = self.shared.vms.lock();
        if vms.remove(&self.id).is_none() {
            return Err(CloudError::NotFound(self.id.clone()));
        }
        drop(vms);
        self.shared.counters.lock().deletes += 1;
        Ok(())
    }
}

#[async_trait]
impl VmHandle for MockVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn poll_state(&self) -> Result<String, CloudError> {
        let mut vms = self.shared.vms.lock();
        let slot = vms
            .get_mut(&self.id)
            .ok_or_else(|| CloudError::NotFound(self.id.clone()))?;
        let state = slot.script[slot.script_pos].clone();
        if slot.script_pos + 1 < slot.script.len() {
            slot.script_pos += 1;
        }
        Ok(state)
    }

    async fn delete(&self) -> Result<(), CloudError> {
        let mut delay = self.locked_retry.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_delete() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_locked() && attempt < self.locked_retry.max_attempts => {
                    tracing::warn!(
                        server_id = %self.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "vm locked, retrying delete"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.locked_retry.next_delay(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_retry() -> LockedRetry {
        LockedRetry {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 5,
        }
    }

    fn intent() -> ProvisionIntent {
        ProvisionIntent {
            web_user_id: "u1".to_string(),
            lab_id: 1,
        }
    }

    #[tokio::test]
    async fn created_vm_walks_the_script() {
        let cloud = MockCloud::new();
        let vm = cloud.create_vm(&intent()).await.unwrap();
        assert!(!vm.id().is_empty());
        assert!(!vm.address().is_empty());
        assert_eq!(vm.poll_state().await.unwrap(), "initializing");
        assert_eq!(vm.poll_state().await.unwrap(), "starting");
        assert_eq!(vm.poll_state().await.unwrap(), "running");
        assert_eq!(vm.poll_state().await.unwrap(), "running");
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_behind() {
        let cloud = MockCloud::new();
        cloud.fail_next_creates(1);
        assert!(cloud.create_vm(&intent()).await.is_err());
        assert_eq!(cloud.live_vms(), 0);
        assert_eq!(cloud.create_count(), 0);

        assert!(cloud.create_vm(&intent()).await.is_ok());
        assert_eq!(cloud.create_count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_vm_and_missing_vm_is_not_found() {
        let cloud = MockCloud::new();
        let vm = cloud.create_vm(&intent()).await.unwrap();
        let id = vm.id().to_string();

        vm.delete().await.unwrap();
        assert_eq!(cloud.live_vms(), 0);
        assert_eq!(cloud.delete_count(), 1);

        let err = cloud.get_vm(&id).await.err().unwrap();
        assert!(err.is_not_found());
        let err = vm.delete().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn locked_delete_retries_until_free() {
        let cloud = MockCloud::new().with_locked_retry(fast_retry());
        let vm = cloud.create_vm(&intent()).await.unwrap();
        cloud.lock_next_deletes(3);
        vm.delete().await.unwrap();
        assert_eq!(cloud.live_vms(), 0);
    }

    #[tokio::test]
    async fn locked_delete_gives_up_after_max_attempts() {
        let cloud = MockCloud::new().with_locked_retry(LockedRetry {
            max_attempts: 3,
            ..fast_retry()
        });
        let vm = cloud.create_vm(&intent()).await.unwrap();
        cloud.lock_next_deletes(10);
        let err = vm.delete().await.unwrap_err();
        assert!(err.is_locked());
        assert_eq!(cloud.live_vms(), 1);
    }

    #[tokio::test]
    async fn seeded_vm_is_addressable() {
        let cloud = MockCloud::new();
        let id = cloud.seed_vm("running");
        let vm = cloud.get_vm(&id).await.unwrap();
        assert_eq!(vm.poll_state().await.unwrap(), "running");
        vm.delete().await.unwrap();
        assert_eq!(cloud.live_vms(), 0);
    }
}
