//! Hand-off types between the pipeline stages: the dispatched job wrapper,
//! the terminal outcome of a job, and the ack unit that closes the loop.

use tokio::sync::oneshot;

use super::Job;

/// A job tagged with the generation of the batch that forwarded it.
///
/// The consumer stamps every poll cycle with a fresh generation and workers
/// echo it on the job's [`Ack`], so an ack can always be correlated to the
/// batch it belongs to.
#[derive(Debug)]
pub struct Dispatched {
    /// Generation of the forwarding batch.
    pub batch: u64,
    pub job: Job,
}

/// One acknowledgment pushed onto the ack queue when a job reaches a
/// terminal state.
///
/// Carries the batch generation the job was forwarded under. A worker from a
/// batch the consumer has already given up on keeps running and still acks;
/// the generation lets the consumer discard such stragglers instead of
/// counting them against a later batch.
#[derive(Debug)]
pub struct Ack {
    /// Generation echoed from the job's [`Dispatched`] wrapper.
    pub batch: u64,
}

/// Outcome of running a job through the processor.
///
/// Successful results are discarded by the dispatcher; failed results are
/// handed to the DLQ handler, which signals durable acceptance through the
/// completion latch.
#[derive(Debug)]
pub struct JobResult {
    /// The job this result describes.
    pub job: Job,
    /// Terminal failure, if the job failed. `None` means success.
    pub error: Option<anyhow::Error>,
    /// Number of processing attempts made (>= 1).
    pub attempts: u32,
    /// One-shot completion latch. Closed by the DLQ handler only after the
    /// result has been durably accepted somewhere. Legal to be absent.
    pub done: Option<oneshot::Sender<()>>,
}

impl JobResult {
    /// Build a failed result with a fresh completion latch attached.
    ///
    /// Returns the receiving half the worker awaits before acking.
    pub fn failure(job: Job, error: anyhow::Error, attempts: u32) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                job,
                error: Some(error),
                attempts,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Close the completion latch, if one is attached.
    ///
    /// A dropped receiver is fine: the worker may already have given up on
    /// the batch.
    pub fn complete(&mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(());
        }
    }

    /// Error message for sink serialization, if the result is a failure.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| format!("{e:#}"))
    }
}
