//! The concurrent core: source consumer, worker-pool dispatcher, and DLQ
//! handler, glued by bounded queues and an explicit ack protocol.
//!
//! The contract that everything else hangs off: no source offset is
//! committed until every job in the batch has reached a terminal state -
//! processed, deduplicated, or durably dead-lettered. Workers push exactly
//! one [`crate::models::Ack`] per accepted job, echoing the generation of
//! the batch that forwarded it; the consumer counts only current-generation
//! acks against the batch size before committing, so stragglers from a
//! batch it already abandoned can never stand in for a later batch's jobs.
//! A failed job's ack is gated on the DLQ handler closing the result's
//! completion latch, which it does only after a sink accepted the record.

mod backoff;
mod consumer;
mod dispatcher;
mod dlq;

pub use backoff::backoff_delay;
pub use consumer::{ConsumerOptions, SourceConsumer};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use dlq::{DlqHandler, DlqHandlerConfig};

use thiserror::Error;

/// Fatal pipeline outcomes surfaced to the process runner.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source failed while polling. Broker state is unknown; restart.
    #[error("source poll failed: {0:#}")]
    Poll(anyhow::Error),
    /// Offset commit failed. Continuing could re-deliver or skip records
    /// unpredictably; restart.
    #[error("offset commit failed: {0:#}")]
    Commit(anyhow::Error),
    /// The root context was cancelled; cooperative shutdown.
    #[error("pipeline cancelled")]
    Cancelled,
}
