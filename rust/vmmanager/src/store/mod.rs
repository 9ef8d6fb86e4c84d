//! Pluggable queue-and-cache storage.
//!
//! The [`Store`] trait is the single abstraction behind both the intent
//! queues and the per-user VM cache. Two implementations exist: the Redis
//! backend for production and an in-memory store for tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::VmRecord;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Queue the front-end pushes provision intents to.
pub const PROVISION_QUEUE: &str = "vmmanager:provision";
/// Queue receiving decommission intents (front-end, provisioner, reconciler).
pub const DECOMMISSION_QUEUE: &str = "vmmanager:decommission";
/// Prefix of per-user VM cache keys.
pub const SERVER_CACHE_PREFIX: &str = "vmmanager:servers:";
/// Cache entry TTL; `expiresAt` is always at or below this horizon.
pub const SERVER_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache key for a user's VM record.
pub fn server_cache_key(web_user_id: &str) -> String {
    format!("{SERVER_CACHE_PREFIX}{web_user_id}")
}

/// Single-shot rate-limit key for a user and operation.
pub fn rate_limit_key(web_user_id: &str, operation: &str) -> String {
    format!("vmmanager:ratelimit:{web_user_id}:{operation}")
}

/// Storage errors surfaced to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Blocking pop timed out with nothing to deliver.
    #[error("queue empty")]
    Empty,
    /// A cached value failed to decode.
    #[error("failed to decode cached record: {0}")]
    Decode(#[from] serde_json::Error),
    /// Backend I/O failure (connection loss, command error).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Queue push/pop, typed cache access, and the atomic single-shot lock.
///
/// All operations are async suspension points; callers that must observe
/// cancellation race them against their cancellation token.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends a raw payload to the named queue. Non-blocking.
    async fn push_payload(&self, queue: &str, payload: &str) -> Result<(), StoreError>;

    /// Pops the head of the named queue, blocking up to `timeout`.
    ///
    /// Returns [`StoreError::Empty`] when the timeout elapses with nothing
    /// to deliver. FIFO per queue.
    async fn pop_payload(&self, queue: &str, timeout: Duration) -> Result<String, StoreError>;

    /// Reads a cached record. `Ok(None)` means "not present", which is not
    /// an error; decode failures and I/O failures are.
    async fn get_record(&self, key: &str) -> Result<Option<VmRecord>, StoreError>;

    /// Writes a record unconditionally with the given TTL.
    async fn put_record(
        &self,
        key: &str,
        record: &VmRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Deletes a record. Idempotent.
    async fn delete_record(&self, key: &str) -> Result<(), StoreError>;

    /// Returns all live records under the prefix. Individual entries that
    /// fail to decode are skipped, never aborting the scan.
    async fn scan_records(&self, prefix: &str) -> Result<Vec<VmRecord>, StoreError>;

    /// Atomic set-if-absent with TTL. `true` means the caller acquired the
    /// slot; `false` means the key was already held (its TTL is untouched).
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}
