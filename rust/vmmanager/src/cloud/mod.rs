//! Cloud provider abstraction.
//!
//! The control plane only ever talks to [`CloudDriver`] and [`VmHandle`];
//! concrete provider adapters live behind these traits. This crate ships the
//! scripted in-memory driver used by tests and local runs.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ProvisionIntent;

pub use mock::MockCloud;

/// Errors from cloud provider operations.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The VM does not exist (anymore).
    #[error("vm not found: {0}")]
    NotFound(String),
    /// The provider refused the operation because the resource is locked.
    /// Drivers retry these internally with bounded backoff.
    #[error("resource locked: {0}")]
    Locked(String),
    /// Any other provider failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Backoff schedule drivers apply to locked-resource errors on delete.
#[derive(Debug, Clone, Copy)]
pub struct LockedRetry {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling the doubling delay is capped at.
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for LockedRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl LockedRetry {
    /// Next delay in the schedule: doubled, capped.
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// A provisioned VM, addressable for polling and deletion.
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Opaque provider handle, stable for the VM's lifetime.
    fn id(&self) -> &str;

    /// IPv6 literal of the VM.
    fn address(&self) -> &str;

    /// Current raw provider state, passed through unnormalized.
    async fn poll_state(&self) -> Result<String, CloudError>;

    /// Deletes the VM. Tolerates an already-stopped VM; locked-resource
    /// errors are retried internally per [`LockedRetry`].
    async fn delete(&self) -> Result<(), CloudError>;
}

/// Create/look up VMs at the provider.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Provisions a VM far enough to have a stable id and IPv6 address.
    /// On failure no resources are left behind.
    async fn create_vm(&self, intent: &ProvisionIntent) -> Result<Box<dyn VmHandle>, CloudError>;

    /// Looks up an existing VM by its provider handle.
    async fn get_vm(&self, server_id: &str) -> Result<Box<dyn VmHandle>, CloudError>;
}
