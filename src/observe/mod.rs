//! Pipeline observability: observer port, prometheus backend, liveness
//! state, and the HTTP endpoint that exposes both.

mod health;
mod metrics;
pub mod server;

pub use health::HealthState;
pub use metrics::PrometheusObserver;

/// Terminal outcome of one job, as recorded by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Processor succeeded.
    Success,
    /// Skipped because the dedup store already had the key.
    DedupSkipped,
    /// Retries exhausted; routed to the dead-letter queue.
    Dlq,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::DedupSkipped => "dedup_skipped",
            JobOutcome::Dlq => "dlq",
        }
    }
}

/// Telemetry hooks the pipeline calls at its decision points. All methods
/// are fire-and-forget and must be cheap; implementations are shared across
/// tasks.
pub trait Observer: Send + Sync {
    /// One job reached a terminal state.
    fn record_job_processed(&self, _outcome: JobOutcome) {}

    /// One failed result was handed to the DLQ handler and acknowledged.
    fn record_dlq_routed(&self) {}

    /// The primary DLQ sink exhausted its retries for one result.
    fn record_dlq_sink_error(&self) {}

    /// One poll-to-terminal batch cycle finished (committed or not).
    fn record_batch_duration(&self, _seconds: f64) {}

    /// Distance between the batch tail and the partition high watermark.
    fn record_consumer_lag(&self, _topic: &str, _partition: i32, _lag: i64) {}
}

/// Observer that records nothing.
pub struct NoopObserver;

impl Observer for NoopObserver {}
