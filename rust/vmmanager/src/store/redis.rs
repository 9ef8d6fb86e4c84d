//! Redis-backed store.
//!
//! Queues are plain Redis lists (RPUSH producer side, BLPOP consumer side),
//! the cache is JSON strings under per-user keys, and the rate-limit lock is
//! an atomic `SET NX EX`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::domain::VmRecord;

use super::{Store, StoreError};

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with a PING.
    ///
    /// `url` accepts the usual `redis://[:password@]host:port[/db]` form.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {e}")))?;
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { client, conn })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push_payload(&self, queue: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(queue, payload).await?;
        Ok(())
    }

    async fn pop_payload(&self, queue: &str, timeout: Duration) -> Result<String, StoreError> {
        // BLPOP would stall every other command multiplexed on the shared
        // connection, so blocking pops run on a dedicated connection.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::from)?;

        let reply: Option<(String, String)> = conn.blpop(queue, timeout.as_secs_f64()).await?;
        match reply {
            Some((_, payload)) => Ok(payload),
            None => Err(StoreError::Empty),
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<VmRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put_record(
        &self,
        key: &str,
        record: &VmRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, data, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_records(&self, prefix: &str) -> Result<Vec<VmRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can expire between SCAN and GET, and a corrupt entry must
            // not take the whole sweep down with it.
            let raw: Option<String> = conn.get(&key).await?;
            let Some(data) = raw else { continue };
            match serde_json::from_str::<VmRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable cache entry");
                }
            }
        }
        Ok(records)
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX EX in one round trip; an existing key keeps its TTL.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}
