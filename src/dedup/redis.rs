//! Redis-backed dedup store for multi-process deployments.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::DedupStore;

/// Key prefix for dedup entries in Redis.
const KEY_PREFIX: &str = "docrelay:dedup:";

/// Shared dedup set with automatic expiry. Lookups and marks degrade to
/// "not a duplicate" / no-op when Redis is unreachable.
pub struct RedisDedupStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisDedupStore {
    /// Connect to Redis. Entries expire after `ttl_seconds`.
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl_seconds })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn is_duplicate(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.exists::<_, bool>(self.entry_key(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key, error = %e, "dedup lookup failed; treating as new");
                false
            }
        }
    }

    async fn mark(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.entry_key(key))
            .arg(1)
            .arg("EX")
            .arg(self.ttl_seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, "dedup mark failed; key may be reprocessed");
        }
    }
}
