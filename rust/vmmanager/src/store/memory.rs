//! In-memory store for tests and local development.
//!
//! Mirrors the Redis backend's observable behavior: FIFO queues with a
//! blocking pop, a TTL'd JSON cache, and a single-shot lock. Faults can be
//! injected per operation to exercise the control plane's retry paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::VmRecord;

use super::{Store, StoreError};

/// Operations a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Push,
    Get,
    Put,
    Delete,
    Scan,
    TryAcquire,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<String>,
    notify: Arc<Notify>,
}

struct CacheEntry {
    data: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    faults: Mutex<HashMap<FaultOp, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls of `op` fail with a backend error.
    pub fn inject_faults(&self, op: FaultOp, count: u32) {
        self.faults.lock().insert(op, count);
    }

    /// Number of payloads currently waiting in a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.items.len())
    }

    /// Raw cache lookup, bypassing decode. Test helper.
    pub fn raw_get(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        entry.is_live(Instant::now()).then(|| entry.data.clone())
    }

    /// Plants a raw value directly in the cache. Test helper for corrupt or
    /// handcrafted entries.
    pub fn raw_put(&self, key: &str, data: &str, ttl: Duration) {
        self.cache.lock().insert(
            key.to_string(),
            CacheEntry {
                data: data.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn consume_fault(&self, op: FaultOp) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Backend("injected fault".to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push_payload(&self, queue: &str, payload: &str) -> Result<(), StoreError> {
        self.consume_fault(FaultOp::Push)?;
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.items.push_back(payload.to_string());
        state.notify.notify_one();
        Ok(())
    }

    async fn pop_payload(&self, queue: &str, timeout: Duration) -> Result<String, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut queues = self.queues.lock();
                let state = queues.entry(queue.to_string()).or_default();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                Arc::clone(&state.notify)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Empty);
            }
            // notify_one stores a permit, so a push racing this re-check is
            // not lost.
            let _ = tokio::time::timeout(deadline - now, notify.notified()).await;
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<VmRecord>, StoreError> {
        self.consume_fault(FaultOp::Get)?;
        let data = {
            let cache = self.cache.lock();
            match cache.get(key) {
                Some(entry) if entry.is_live(Instant::now()) => entry.data.clone(),
                _ => return Ok(None),
            }
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn put_record(
        &self,
        key: &str,
        record: &VmRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.consume_fault(FaultOp::Put)?;
        let data = serde_json::to_string(record)?;
        self.cache.lock().insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        self.consume_fault(FaultOp::Delete)?;
        self.cache.lock().remove(key);
        Ok(())
    }

    async fn scan_records(&self, prefix: &str) -> Result<Vec<VmRecord>, StoreError> {
        self.consume_fault(FaultOp::Scan)?;
        let now = Instant::now();
        let raw: Vec<String> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
                .map(|(_, entry)| entry.data.clone())
                .collect()
        };

        let mut records = Vec::with_capacity(raw.len());
        for data in raw {
            match serde_json::from_str::<VmRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable cache entry");
                }
            }
        }
        Ok(records)
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.consume_fault(FaultOp::TryAcquire)?;
        let now = Instant::now();
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.is_live(now) => Ok(false),
            _ => {
                cache.insert(
                    key.to_string(),
                    CacheEntry {
                        data: "1".to_string(),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(true)
            }
        }
    }
}
