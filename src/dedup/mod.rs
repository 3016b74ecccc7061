//! Duplicate-suppression port and backends.
//!
//! The store is an advisory best-effort filter: it is consulted before
//! processing and marked only after success, so re-processing after a crash
//! is still possible. Backend errors are swallowed to "not a duplicate" so a
//! degraded store never stalls the pipeline.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::LruDedupStore;
#[cfg(feature = "redis-backend")]
pub use redis::RedisDedupStore;

use std::sync::Arc;

use async_trait::async_trait;

/// A set of dedup keys that were successfully processed within the store's
/// horizon. Implementations must be safe against concurrent callers.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// True when the key was already processed successfully.
    async fn is_duplicate(&self, key: &str) -> bool;

    /// Record a successful processing of the key.
    async fn mark(&self, key: &str);
}

/// Which backend to use for duplicate suppression.
#[derive(Debug, Clone)]
pub enum DedupBackend {
    /// No dedup at all.
    Disabled,
    /// Process-local LRU set.
    Memory { capacity: usize },
    /// Shared Redis set with a TTL horizon.
    Redis { url: String, ttl_seconds: u64 },
}

/// Build the configured store. `None` means dedup is disabled.
pub async fn build(backend: DedupBackend) -> anyhow::Result<Option<Arc<dyn DedupStore>>> {
    match backend {
        DedupBackend::Disabled => Ok(None),
        DedupBackend::Memory { capacity } => {
            Ok(Some(Arc::new(LruDedupStore::new(capacity))))
        }
        #[cfg(feature = "redis-backend")]
        DedupBackend::Redis { url, ttl_seconds } => Ok(Some(Arc::new(
            RedisDedupStore::connect(&url, ttl_seconds).await?,
        ))),
        #[cfg(not(feature = "redis-backend"))]
        DedupBackend::Redis { .. } => anyhow::bail!(
            "redis dedup requested but this build lacks the redis-backend feature"
        ),
    }
}
