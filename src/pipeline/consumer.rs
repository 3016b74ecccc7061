//! Source consumer: polls batches, forwards jobs, gates commits on acks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use tokio::time::{sleep_until, timeout, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::PipelineError;
use crate::models::{Ack, Dispatched, Job};
use crate::observe::{HealthState, NoopObserver, Observer};
use crate::source::{JobSource, SourceError};
use crate::trace;

/// Consumer tuning. The defaults disable every timeout: a slow downstream
/// then exerts pure backpressure instead of triggering re-delivery.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Longest tolerated gap between two consecutive acks of one batch.
    pub ack_timeout: Option<Duration>,
    /// Wall-clock bound on forwarding plus ack-await for one batch.
    pub max_batch_wait: Option<Duration>,
    /// Consecutive timed-out batches before `healthy()` turns false.
    pub health_threshold: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            ack_timeout: None,
            max_batch_wait: None,
            health_threshold: 3,
        }
    }
}

/// How one batch's dispatch-and-await phase ended.
enum BatchWait {
    /// Every job acked.
    Complete,
    /// The gap between acks exceeded `ack_timeout`.
    AckTimeout,
    /// `max_batch_wait` elapsed before all acks arrived.
    Deadline,
    /// Root cancellation, or a pipeline queue closed underneath us.
    Cancelled,
}

/// Drains a [`JobSource`] batch by batch.
///
/// Each iteration polls, forwards every job in source order through the
/// bounded work queue (blocking when it is full - that is the backpressure
/// path), awaits one ack per job, and only then commits. A timed-out batch
/// is never committed; the source re-delivers it on the next poll.
///
/// Every batch gets a fresh generation number. Jobs are forwarded tagged
/// with it and workers echo it on the ack, so a straggler ack from a batch
/// this consumer already gave up on is recognized and discarded instead of
/// being counted against the batch currently awaiting.
pub struct SourceConsumer {
    source: Box<dyn JobSource>,
    jobs: Sender<Dispatched>,
    acks: Receiver<Ack>,
    observer: Arc<dyn Observer>,
    options: ConsumerOptions,
    health: Option<Arc<HealthState>>,
    consecutive_timeouts: u32,
    batch_serial: u64,
}

impl SourceConsumer {
    pub fn new(source: Box<dyn JobSource>, jobs: Sender<Dispatched>, acks: Receiver<Ack>) -> Self {
        Self {
            source,
            jobs,
            acks,
            observer: Arc::new(NoopObserver),
            options: ConsumerOptions::default(),
            health: None,
            consecutive_timeouts: 0,
            batch_serial: 0,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Mirror health transitions into shared state for the liveness probe.
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    fn healthy(&self) -> bool {
        self.consecutive_timeouts < self.options.health_threshold
    }

    fn publish_health(&self) {
        if let Some(health) = &self.health {
            health.set_consumer_healthy(self.healthy());
        }
    }

    /// Run until the source closes (Ok), the token cancels, or a fatal
    /// source/commit error occurs.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), PipelineError> {
        loop {
            let started = Instant::now();

            let batch = tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                polled = self.source.poll().instrument(trace::poll_span()) => match polled {
                    Ok(batch) => batch,
                    Err(SourceError::Closed) => {
                        info!("source closed; consumer exiting");
                        self.source.close().await;
                        return Ok(());
                    }
                    Err(SourceError::Backend(e)) => return Err(PipelineError::Poll(e)),
                },
            };
            debug!(jobs = batch.len(), "polled batch");

            self.batch_serial += 1;
            let batch_id = self.batch_serial;
            let tail_offsets = batch_tail_offsets(&batch);
            let deadline = self.options.max_batch_wait.map(|d| TokioInstant::now() + d);

            match self.dispatch_and_await(batch, batch_id, deadline, &token).await {
                BatchWait::Complete => {
                    self.consecutive_timeouts = 0;
                    self.publish_health();

                    let committed = tokio::select! {
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                        result = self.source.commit().instrument(trace::commit_span()) => result,
                    };
                    if let Err(e) = committed {
                        return Err(PipelineError::Commit(e));
                    }
                    self.record_lag(&tail_offsets);
                }
                BatchWait::AckTimeout | BatchWait::Deadline => {
                    self.consecutive_timeouts += 1;
                    self.publish_health();
                    warn!(
                        consecutive_timeouts = self.consecutive_timeouts,
                        "batch ack wait timed out; skipping commit so the batch re-delivers"
                    );
                }
                BatchWait::Cancelled => return Err(PipelineError::Cancelled),
            }

            self.observer
                .record_batch_duration(started.elapsed().as_secs_f64());
            if let Some(health) = &self.health {
                health.record_batch();
            }
        }
    }

    /// Forward every job tagged with the batch generation, then await one
    /// current-generation ack per job. Jobs are forwarded in source order; a
    /// full work queue blocks us here, which is what stalls polling when
    /// downstream is slow.
    ///
    /// An ack carrying an older generation belongs to a batch that already
    /// timed out; its worker kept running and acked late. Counting it here
    /// would let a later batch commit with one of its own jobs unfinished,
    /// so such stragglers are discarded.
    async fn dispatch_and_await(
        &mut self,
        batch: Vec<Job>,
        batch_id: u64,
        deadline: Option<TokioInstant>,
        token: &CancellationToken,
    ) -> BatchWait {
        let batch_deadline = async move {
            match deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(batch_deadline);

        let expected = batch.len();
        for job in batch {
            let dispatched = Dispatched {
                batch: batch_id,
                job,
            };
            tokio::select! {
                _ = token.cancelled() => return BatchWait::Cancelled,
                _ = &mut batch_deadline => return BatchWait::Deadline,
                sent = self.jobs.send(dispatched) => {
                    if sent.is_err() {
                        return BatchWait::Cancelled;
                    }
                }
            }
        }

        let mut acked = 0;
        while acked < expected {
            // The ack gap timer restarts on every received ack.
            let ack_timeout = self.options.ack_timeout;
            let recv = self.acks.recv();
            let next_ack = async move {
                match ack_timeout {
                    Some(t) => timeout(t, recv).await,
                    None => Ok(recv.await),
                }
            };
            tokio::select! {
                _ = token.cancelled() => return BatchWait::Cancelled,
                _ = &mut batch_deadline => return BatchWait::Deadline,
                received = next_ack => match received {
                    Ok(Ok(ack)) => {
                        if ack.batch == batch_id {
                            acked += 1;
                        } else {
                            debug!(
                                ack_batch = ack.batch,
                                current_batch = batch_id,
                                "discarding straggler ack from an abandoned batch"
                            );
                        }
                    }
                    Ok(Err(_closed)) => return BatchWait::Cancelled,
                    Err(_elapsed) => return BatchWait::AckTimeout,
                },
            }
        }
        BatchWait::Complete
    }

    fn record_lag(&mut self, tail_offsets: &HashMap<(String, i32), i64>) {
        let Some(reporter) = self.source.lag_reporter() else {
            return;
        };
        let marks = reporter.high_water_marks();
        for ((topic, partition), tail) in tail_offsets {
            if let Some(mark) = marks.get(&(topic.clone(), *partition)) {
                let lag = (mark - tail).max(0);
                self.observer.record_consumer_lag(topic, *partition, lag);
            }
        }
    }
}

/// Highest delivered offset per (topic, partition) in the batch.
fn batch_tail_offsets(batch: &[Job]) -> HashMap<(String, i32), i64> {
    let mut tails = HashMap::new();
    for job in batch {
        let tail = tails
            .entry((job.topic.clone(), job.partition))
            .or_insert(job.offset);
        if job.offset > *tail {
            *tail = job.offset;
        }
    }
    tails
}
