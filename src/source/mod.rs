//! Source port: a partitioned, ordered log consumed in batches with manual
//! offset commit.
//!
//! Adapters must never return an empty batch to mean "no data right now" -
//! they either block inside `poll` until data arrives or signal shutdown via
//! [`SourceError::Closed`]. The consumer relies on that discipline.

mod memory;

pub use memory::{MemorySource, MemorySourceHandle};

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Job;

/// Errors surfaced by a job source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Clean shutdown sentinel: the source has been drained or revoked and
    /// the consumer should exit without error.
    #[error("source closed")]
    Closed,
    /// Anything else is fatal to the consumer.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Optional capability: report the offset just past the newest record per
/// partition, for consumer-lag accounting.
pub trait LagReporter: Send + Sync {
    /// Current high watermarks keyed by (topic, partition).
    fn high_water_marks(&self) -> HashMap<(String, i32), i64>;
}

/// A partitioned log delivering jobs in batches.
///
/// `poll` returns the records between the committed offsets and the head of
/// the log; a batch that is never committed is delivered again on the next
/// poll. `commit` durably advances the offsets covered by the last polled
/// batch.
#[async_trait]
pub trait JobSource: Send {
    /// Fetch the next batch. Blocks until data is available, the source is
    /// closed, or the calling future is dropped.
    async fn poll(&mut self) -> Result<Vec<Job>, SourceError>;

    /// Durably advance the source offsets past the last polled batch.
    async fn commit(&mut self) -> anyhow::Result<()>;

    /// Release any held resources. Called once on clean shutdown.
    async fn close(&mut self);

    /// Downcast hook for sources that can report high watermarks.
    fn lag_reporter(&self) -> Option<&dyn LagReporter> {
        None
    }
}
