//! VM record and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized lifecycle status consumed by the lab front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// VM is being created or is not yet reachable.
    Provisioning,
    /// VM reported running by the provider.
    Running,
    /// VM is shutting down or being deleted.
    Stopping,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Maps a raw provider state to the normalized front-end status.
///
/// The raw string itself is carried verbatim in [`VmRecord::cloud_status`];
/// only the normalization lives here.
pub fn normalize_cloud_state(cloud_state: &str) -> VmStatus {
    match cloud_state {
        "running" => VmStatus::Running,
        "starting" | "initializing" => VmStatus::Provisioning,
        "stopping" | "off" | "deleting" => VmStatus::Stopping,
        _ => VmStatus::Provisioning,
    }
}

/// Whether the VM is actually reachable for the end user.
///
/// For the reference provider only `running` means reachable; a provider may
/// report `running` while still initializing, so the converse of the
/// `available => running` invariant does not hold.
pub fn is_available(cloud_state: &str) -> bool {
    cloud_state == "running"
}

/// The cached per-user VM record.
///
/// One record per `webUserId`; provisioning a different lab for the same user
/// overwrites it. Field names are pinned to the cache wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    /// SSH login name on the VM.
    pub user: String,
    /// IPv6 literal; empty while provisioning.
    pub address: String,
    /// Normalized lifecycle status.
    pub status: VmStatus,
    /// True iff the VM is reachable.
    pub available: bool,
    /// Raw provider state, carried verbatim.
    pub cloud_status: String,
    /// Opaque provider handle; the authority for deletion.
    pub server_id: String,
    /// Business expiry; the reconciler decommissions past this instant.
    pub expires_at: DateTime<Utc>,
    /// External user identity, repeated inside the record so the reconciler
    /// can synthesize a decommission intent.
    pub web_user_id: String,
    /// Lab the record was provisioned for.
    pub lab_id: u32,
}

impl VmRecord {
    /// Builds the initial record written before the cloud call.
    pub fn provisioning(
        user: impl Into<String>,
        web_user_id: impl Into<String>,
        lab_id: u32,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user: user.into(),
            address: String::new(),
            status: VmStatus::Provisioning,
            available: false,
            cloud_status: String::new(),
            server_id: String::new(),
            expires_at,
            web_user_id: web_user_id.into(),
            lab_id,
        }
    }

    /// Applies a freshly observed raw provider state.
    pub fn observe_cloud_state(&mut self, cloud_state: &str) {
        self.status = normalize_cloud_state(cloud_state);
        self.available = is_available(cloud_state);
        self.cloud_status = cloud_state.to_string();
    }

    /// True once the record is past its business expiry.
    ///
    /// An `expires_at` exactly equal to `now` is not yet expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
