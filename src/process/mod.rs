//! Processing-stage port and the built-in downstream adapters.

mod forward;
mod staging;

pub use forward::HttpForwarder;
pub use staging::StagingWriter;

use async_trait::async_trait;

use crate::models::Job;

/// The pluggable processing stage.
///
/// Any error is treated as retryable by the dispatcher; adapters that know a
/// failure is permanent should still surface it and let the retry budget and
/// the DLQ capture it. Cancellation reaches an adapter by its future being
/// dropped, so long operations must be cancel-safe at await points.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<()>;
}
