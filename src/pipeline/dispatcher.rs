//! Worker-pool dispatcher: dedup, retry with backoff, ack or DLQ hand-off.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::backoff::backoff_delay;
use crate::dedup::DedupStore;
use crate::models::{Ack, Dispatched, Job, JobResult};
use crate::observe::{JobOutcome, NoopObserver, Observer};
use crate::process::Processor;
use crate::trace;

/// Worker-pool tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub num_workers: usize,
    /// Total processing attempts per job, including the first.
    pub max_retries: u32,
    /// Work queue capacity. Recommended `2 * num_workers`.
    pub job_buffer: usize,
    /// DLQ queue capacity. Recommended `num_workers`.
    pub dlq_buffer: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Escape hatch: ack a DLQ'd job even if its latch never closes. Only
    /// safe together with a fallback sink; see the handler docs.
    pub dlq_ack_timeout: Option<Duration>,
    /// Deadline over one job's attempts and backoff sleeps.
    pub job_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_retries: 3,
            job_buffer: 8,
            dlq_buffer: 4,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            dlq_ack_timeout: None,
            job_timeout: None,
        }
    }
}

/// Owns the pipeline queues and fans jobs out to `num_workers` workers.
///
/// Peers take their queue ends before `run`: the consumer sends on `jobs()`
/// and receives `acks()`; the DLQ handler receives `dlq()`. Every accepted
/// job produces exactly one ack, tagged with the batch generation the job
/// arrived under, whatever its outcome - the single exception is
/// cancellation, which deliberately withholds the ack so the uncommitted
/// batch re-delivers.
pub struct Dispatcher {
    processor: Arc<dyn Processor>,
    config: DispatcherConfig,
    observer: Arc<dyn Observer>,
    dedup: Option<Arc<dyn DedupStore>>,
    jobs_tx: Sender<Dispatched>,
    jobs_rx: Receiver<Dispatched>,
    dlq_tx: Sender<JobResult>,
    dlq_rx: Receiver<JobResult>,
    acks_tx: Sender<Ack>,
    acks_rx: Receiver<Ack>,
}

impl Dispatcher {
    pub fn new(processor: Arc<dyn Processor>, config: DispatcherConfig) -> Self {
        let (jobs_tx, jobs_rx) = async_channel::bounded(config.job_buffer.max(1));
        let (dlq_tx, dlq_rx) = async_channel::bounded(config.dlq_buffer.max(1));
        let (acks_tx, acks_rx) = async_channel::bounded(config.job_buffer.max(1));
        Self {
            processor,
            config,
            observer: Arc::new(NoopObserver),
            dedup: None,
            jobs_tx,
            jobs_rx,
            dlq_tx,
            dlq_rx,
            acks_tx,
            acks_rx,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_dedup(mut self, dedup: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Send end of the work queue, for the consumer.
    pub fn jobs(&self) -> Sender<Dispatched> {
        self.jobs_tx.clone()
    }

    /// Receive end of the DLQ queue, for the DLQ handler.
    pub fn dlq(&self) -> Receiver<JobResult> {
        self.dlq_rx.clone()
    }

    /// Receive end of the ack queue, for the consumer.
    pub fn acks(&self) -> Receiver<Ack> {
        self.acks_rx.clone()
    }

    /// Run the pool; returns once every worker has exited. Workers exit when
    /// the work queue is closed and drained, or on cancellation.
    pub async fn run(self, token: CancellationToken) {
        let Dispatcher {
            processor,
            config,
            observer,
            dedup,
            jobs_tx,
            jobs_rx,
            dlq_tx,
            dlq_rx,
            acks_tx,
            acks_rx,
        } = self;
        // Only peers may hold these ends, otherwise the queues never close.
        drop(jobs_tx);
        drop(dlq_rx);
        drop(acks_rx);

        let config = Arc::new(config);
        let mut handles = Vec::with_capacity(config.num_workers.max(1));
        for worker_id in 0..config.num_workers.max(1) {
            let worker = Worker {
                id: worker_id,
                jobs: jobs_rx.clone(),
                dlq: dlq_tx.clone(),
                acks: acks_tx.clone(),
                processor: processor.clone(),
                dedup: dedup.clone(),
                observer: observer.clone(),
                config: config.clone(),
            };
            let token = token.clone();
            handles.push(tokio::spawn(async move { worker.run(token).await }));
        }
        drop(jobs_rx);
        drop(dlq_tx);
        drop(acks_tx);

        for handle in handles {
            let _ = handle.await;
        }
        debug!("all workers exited");
    }
}

struct Worker {
    id: usize,
    jobs: Receiver<Dispatched>,
    dlq: Sender<JobResult>,
    acks: Sender<Ack>,
    processor: Arc<dyn Processor>,
    dedup: Option<Arc<dyn DedupStore>>,
    observer: Arc<dyn Observer>,
    config: Arc<DispatcherConfig>,
}

impl Worker {
    async fn run(self, token: CancellationToken) {
        debug!(worker = self.id, "worker started");
        loop {
            let dispatched = tokio::select! {
                _ = token.cancelled() => break,
                received = self.jobs.recv() => match received {
                    Ok(dispatched) => dispatched,
                    Err(_closed) => break,
                },
            };
            self.handle(dispatched, &token).await;
        }
        debug!(worker = self.id, "worker exiting");
    }

    async fn handle(&self, dispatched: Dispatched, token: &CancellationToken) {
        let Dispatched { batch, job } = dispatched;
        let dedup_key = job.dedup_key();
        if let Some(store) = &self.dedup {
            if store.is_duplicate(&dedup_key).await {
                debug!(worker = self.id, key = %dedup_key, "duplicate job skipped");
                self.observer.record_job_processed(JobOutcome::DedupSkipped);
                self.send_ack(batch, token).await;
                return;
            }
        }

        let inbound = trace::extract(&job.headers);
        let span = trace::process_span(&job, inbound.as_ref());
        let (attempts, error) = self
            .process_with_retry(&job, token)
            .instrument(span)
            .await;

        match error {
            None => {
                if let Some(store) = &self.dedup {
                    store.mark(&dedup_key).await;
                }
                self.observer.record_job_processed(JobOutcome::Success);
                self.send_ack(batch, token).await;
            }
            Some(error) => {
                if token.is_cancelled() {
                    // No DLQ hand-off and no ack: the batch stays
                    // uncommitted and the job re-delivers.
                    return;
                }
                self.route_to_dlq(job, batch, error, attempts, token).await;
            }
        }
    }

    /// Attempt the processor up to `max_retries` times. Returns the attempt
    /// count and the final error, `None` on success.
    async fn process_with_retry(
        &self,
        job: &Job,
        token: &CancellationToken,
    ) -> (u32, Option<anyhow::Error>) {
        let total = self.config.max_retries.max(1);
        let deadline = self.config.job_timeout.map(|t| TokioInstant::now() + t);
        let mut last_error = None;

        for attempt in 1..=total {
            match self.process_once(job, deadline, token).await {
                Ok(()) => {
                    debug!(worker = self.id, attempt, "job processed");
                    return (attempt, None);
                }
                Err(error) => {
                    warn!(
                        worker = self.id,
                        topic = %job.topic,
                        partition = job.partition,
                        offset = job.offset,
                        attempt,
                        error = %format!("{error:#}"),
                        "processing attempt failed"
                    );
                    last_error = Some(error);
                }
            }
            if token.is_cancelled() {
                return (attempt, last_error);
            }
            if attempt < total && !self.config.base_backoff.is_zero() {
                let delay = clamp_to_deadline(
                    backoff_delay(attempt, self.config.base_backoff, self.config.max_backoff),
                    deadline,
                );
                if !delay.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return (attempt, last_error),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        (total, last_error)
    }

    /// One processor attempt, racing the job deadline and cancellation.
    /// Cancellation drops the in-flight processor future.
    async fn process_once(
        &self,
        job: &Job,
        deadline: Option<TokioInstant>,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let work = self.processor.process(job);
        tokio::select! {
            _ = token.cancelled() => Err(anyhow::anyhow!("processing cancelled")),
            result = async {
                match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(anyhow::anyhow!("job deadline exceeded")),
                    },
                    None => work.await,
                }
            } => result,
        }
    }

    /// Hand the failed job to the DLQ handler and wait for its completion
    /// latch. The ack fires only after a positive latch closure (or the
    /// configured escape-hatch timeout); cancellation or an unclosed latch
    /// withholds it so the batch re-delivers.
    async fn route_to_dlq(
        &self,
        job: Job,
        batch: u64,
        error: anyhow::Error,
        attempts: u32,
        token: &CancellationToken,
    ) {
        let span = trace::dlq_span(&job);
        async {
            let (result, done) = JobResult::failure(job, error, attempts);
            tokio::select! {
                _ = token.cancelled() => return,
                sent = self.dlq.send(result) => {
                    if sent.is_err() {
                        warn!(worker = self.id, "dlq queue closed; withholding ack for re-delivery");
                        return;
                    }
                }
            }

            // Completes only on a positive close; a dropped latch parks
            // forever so only cancellation or the escape hatch get us out.
            let latch = async {
                match done.await {
                    Ok(()) => (),
                    Err(_unclosed) => std::future::pending().await,
                }
            };
            let acked = match self.config.dlq_ack_timeout {
                Some(t) => tokio::select! {
                    _ = token.cancelled() => false,
                    closed = tokio::time::timeout(t, latch) => {
                        if closed.is_err() {
                            warn!(worker = self.id, "dlq ack timeout elapsed; acking without sink confirmation");
                        }
                        true
                    }
                },
                None => tokio::select! {
                    _ = token.cancelled() => false,
                    _ = latch => true,
                },
            };
            if acked {
                self.observer.record_job_processed(JobOutcome::Dlq);
                self.observer.record_dlq_routed();
                self.send_ack(batch, token).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn send_ack(&self, batch: u64, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.acks.send(Ack { batch }) => {}
        }
    }
}

fn clamp_to_deadline(delay: Duration, deadline: Option<TokioInstant>) -> Duration {
    match deadline {
        Some(deadline) => delay.min(deadline.saturating_duration_since(TokioInstant::now())),
        None => delay,
    }
}
