//! DLQ handler: durably lands failed results, then releases their latches.

use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::JobResult;
use crate::observe::{NoopObserver, Observer};
use crate::sink::DlqSink;

/// DLQ handler tuning.
#[derive(Debug, Clone)]
pub struct DlqHandlerConfig {
    /// Extra attempts against the primary sink after the first.
    pub max_sink_retries: u32,
    /// Pause between primary sink attempts.
    pub retry_delay: Duration,
}

impl Default for DlqHandlerConfig {
    fn default() -> Self {
        Self {
            max_sink_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Consumes failed results and publishes them via the primary sink, falling
/// back to a secondary sink when the primary's retries are exhausted.
///
/// The completion latch is the only positive terminal acknowledgment back to
/// the dispatcher. It is closed strictly after a sink accepted the record;
/// when every sink fails, the latch is left unclosed on purpose - the batch
/// then never commits and the record re-delivers instead of being lost.
pub struct DlqHandler {
    dlq: Receiver<JobResult>,
    sink: Arc<dyn DlqSink>,
    fallback: Option<Arc<dyn DlqSink>>,
    observer: Arc<dyn Observer>,
    config: DlqHandlerConfig,
}

impl DlqHandler {
    pub fn new(dlq: Receiver<JobResult>, sink: Arc<dyn DlqSink>, config: DlqHandlerConfig) -> Self {
        Self {
            dlq,
            sink,
            fallback: None,
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn DlqSink>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Run until the DLQ queue closes or the token cancels.
    pub async fn run(self, token: CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                received = self.dlq.recv() => match received {
                    Ok(result) => result,
                    Err(_closed) => return,
                },
            };
            self.handle(result, &token).await;
        }
    }

    async fn handle(&self, mut result: JobResult, token: &CancellationToken) {
        let budget = 1 + self.config.max_sink_retries;
        let mut last_error = None;

        for attempt in 1..=budget {
            let sent = tokio::select! {
                // Dropping the result leaves its latch unclosed; no ack fires.
                _ = token.cancelled() => return,
                sent = self.sink.send(&result) => sent,
            };
            match sent {
                Ok(()) => {
                    result.complete();
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %format!("{e:#}"),
                        "dead-letter sink attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < budget {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(self.config.retry_delay) => {}
                        }
                    }
                }
            }
        }

        let job = &result.job;
        error!(
            topic = %job.topic,
            partition = job.partition,
            offset = job.offset,
            attempts = result.attempts,
            error = %last_error.as_ref().map(|e| format!("{e:#}")).unwrap_or_default(),
            "dead-letter sink exhausted"
        );
        self.observer.record_dlq_sink_error();

        let Some(fallback) = &self.fallback else {
            // Latch stays unclosed: the batch cannot commit and the record
            // re-delivers rather than vanishing.
            return;
        };

        let sent = tokio::select! {
            _ = token.cancelled() => return,
            sent = fallback.send(&result) => sent,
        };
        match sent {
            Ok(()) => {
                info!(
                    topic = %job.topic,
                    partition = job.partition,
                    offset = job.offset,
                    "fallback sink accepted dead letter"
                );
                result.complete();
            }
            Err(e) => {
                error!(
                    topic = %job.topic,
                    partition = job.partition,
                    offset = job.offset,
                    error = %format!("{e:#}"),
                    "fallback sink failed; leaving record unacknowledged for re-delivery"
                );
            }
        }
    }
}
