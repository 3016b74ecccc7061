//! Dead-letter sink port and the fallback file backend.
//!
//! A sink accepting a result means the record is durably stored somewhere an
//! operator can recover it from. The DLQ handler closes the result's
//! completion latch only after such an acceptance.

mod file;

pub use file::{FallbackFileSink, FallbackRecord};

use async_trait::async_trait;

use crate::models::JobResult;

/// Origin topic of the failed record.
pub const DLQ_HEADER_SOURCE_TOPIC: &str = "source_topic";
/// Origin partition, decimal string.
pub const DLQ_HEADER_SOURCE_PARTITION: &str = "source_partition";
/// Origin offset, decimal string.
pub const DLQ_HEADER_SOURCE_OFFSET: &str = "source_offset";
/// Processing attempts made before dead-lettering, decimal string.
pub const DLQ_HEADER_ATTEMPTS: &str = "attempts";
/// Time of dead-lettering, RFC 3339 UTC.
pub const DLQ_HEADER_FAILED_AT: &str = "failed_at";
/// Terminal error message. Only present when an error exists.
pub const DLQ_HEADER_ERROR: &str = "error";

/// Destination for results whose retry budget is exhausted.
#[async_trait]
pub trait DlqSink: Send + Sync {
    /// Durably accept one failed result. An error means the record was NOT
    /// stored and the caller must not acknowledge it.
    async fn send(&self, result: &JobResult) -> anyhow::Result<()>;
}
