//! End-to-end pipeline scenarios over in-memory ports.
//!
//! Each test wires a real consumer, dispatcher, and DLQ handler with
//! scripted processor/sink doubles and asserts the commit/ack/DLQ contract.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use docrelay::dedup::{DedupStore, LruDedupStore};
use docrelay::models::{Ack, Dispatched, Headers, Job, JobResult};
use docrelay::observe::{JobOutcome, Observer};
use docrelay::pipeline::{
    ConsumerOptions, Dispatcher, DispatcherConfig, DlqHandler, DlqHandlerConfig, PipelineError,
    SourceConsumer,
};
use docrelay::process::Processor;
use docrelay::sink::{DlqSink, FallbackFileSink, FallbackRecord};
use docrelay::source::{MemorySource, MemorySourceHandle};

fn job(key: &str, offset: i64) -> Job {
    Job {
        key: key.as_bytes().to_vec(),
        value: format!("document-{offset}").into_bytes(),
        topic: "documents.raw".to_string(),
        partition: 0,
        offset,
        headers: Headers::new(),
        timestamp: Utc::now(),
    }
}

/// Processor scripted per call: fails the first `fail_first` calls, and
/// optionally sleeps on the very first call.
struct ScriptedProcessor {
    calls: AtomicU32,
    fail_first: u32,
    first_call_delay: Option<Duration>,
}

impl ScriptedProcessor {
    fn succeeding() -> Self {
        Self::failing_first(0)
    }

    fn failing_first(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
            first_call_delay: None,
        }
    }

    fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    fn slow_first_call(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            first_call_delay: Some(delay),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, _job: &Job) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            if let Some(delay) = self.first_call_delay {
                tokio::time::sleep(delay).await;
            }
        }
        if call <= self.fail_first {
            anyhow::bail!("simulated processing failure");
        }
        Ok(())
    }
}

/// Sink double that records accepted results and fails its first
/// `fail_first` sends.
struct RecordingSink {
    calls: AtomicU32,
    fail_first: u32,
    accepted: Mutex<Vec<(Vec<u8>, u32, Option<String>)>>,
}

impl RecordingSink {
    fn accepting() -> Self {
        Self::failing_first(0)
    }

    fn failing_first(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
            accepted: Mutex::new(Vec::new()),
        }
    }

    fn broken() -> Self {
        Self::failing_first(u32::MAX)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn accepted(&self) -> Vec<(Vec<u8>, u32, Option<String>)> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DlqSink for RecordingSink {
    async fn send(&self, result: &JobResult) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            anyhow::bail!("simulated sink outage");
        }
        self.accepted.lock().unwrap().push((
            result.job.key.clone(),
            result.attempts,
            result.error_message(),
        ));
        Ok(())
    }
}

#[derive(Default)]
struct CountingObserver {
    success: AtomicUsize,
    dedup_skipped: AtomicUsize,
    dlq: AtomicUsize,
    dlq_routed: AtomicUsize,
    sink_errors: AtomicUsize,
    batches: AtomicUsize,
}

impl Observer for CountingObserver {
    fn record_job_processed(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Success => &self.success,
            JobOutcome::DedupSkipped => &self.dedup_skipped,
            JobOutcome::Dlq => &self.dlq,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn record_dlq_routed(&self) {
        self.dlq_routed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_dlq_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_batch_duration(&self, _seconds: f64) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestPipeline {
    source: MemorySourceHandle,
    observer: Arc<CountingObserver>,
    token: CancellationToken,
    consumer: JoinHandle<Result<(), PipelineError>>,
    dispatcher: JoinHandle<()>,
    handler: JoinHandle<()>,
}

struct PipelineBuilder {
    source: MemorySource,
    processor: Arc<dyn Processor>,
    sink: Arc<dyn DlqSink>,
    fallback: Option<Arc<dyn DlqSink>>,
    dedup: Option<Arc<dyn DedupStore>>,
    dispatcher_config: DispatcherConfig,
    handler_config: DlqHandlerConfig,
    consumer_options: ConsumerOptions,
}

impl PipelineBuilder {
    fn new(source: MemorySource, processor: Arc<dyn Processor>, sink: Arc<dyn DlqSink>) -> Self {
        Self {
            source,
            processor,
            sink,
            fallback: None,
            dedup: None,
            dispatcher_config: DispatcherConfig {
                // Keep tests fast: tiny backoff, small pool.
                num_workers: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
                ..DispatcherConfig::default()
            },
            handler_config: DlqHandlerConfig {
                max_sink_retries: 0,
                retry_delay: Duration::from_millis(1),
            },
            consumer_options: ConsumerOptions::default(),
        }
    }

    fn start(self) -> TestPipeline {
        let observer = Arc::new(CountingObserver::default());
        let token = CancellationToken::new();

        let handle = self.source.handle();
        let mut dispatcher = Dispatcher::new(self.processor, self.dispatcher_config)
            .with_observer(observer.clone());
        if let Some(dedup) = self.dedup {
            dispatcher = dispatcher.with_dedup(dedup);
        }

        let mut handler = DlqHandler::new(dispatcher.dlq(), self.sink, self.handler_config)
            .with_observer(observer.clone());
        if let Some(fallback) = self.fallback {
            handler = handler.with_fallback(fallback);
        }

        let consumer =
            SourceConsumer::new(Box::new(self.source), dispatcher.jobs(), dispatcher.acks())
                .with_observer(observer.clone())
                .with_options(self.consumer_options);

        TestPipeline {
            source: handle,
            observer: observer.clone(),
            token: token.clone(),
            consumer: tokio::spawn(consumer.run(token.clone())),
            dispatcher: tokio::spawn(dispatcher.run(token.clone())),
            handler: tokio::spawn(handler.run(token)),
        }
    }
}

impl TestPipeline {
    /// Await the consumer's own exit (source drained or fatal error).
    async fn finish(self) -> Result<(), PipelineError> {
        let outcome = tokio::time::timeout(Duration::from_secs(5), self.consumer)
            .await
            .expect("consumer did not finish in time")
            .expect("consumer panicked");
        self.token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.dispatcher).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handler).await;
        outcome
    }

    /// Cancel the pipeline, then await everything.
    async fn cancel_and_finish(self) -> Result<(), PipelineError> {
        self.token.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), self.consumer)
            .await
            .expect("consumer did not finish in time")
            .expect("consumer panicked");
        let _ = tokio::time::timeout(Duration::from_secs(5), self.dispatcher).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handler).await;
        outcome
    }
}

/// Poll a condition until it holds or two seconds pass.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn happy_path_commits_once_and_marks_dedup() {
    let source = MemorySource::new();
    source.push_batch(vec![job("a", 0), job("b", 1)]);

    let processor = Arc::new(ScriptedProcessor::succeeding());
    let sink = Arc::new(RecordingSink::accepting());
    let dedup = Arc::new(LruDedupStore::new(64));

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dedup = Some(dedup.clone());
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    assert_eq!(handle.commits(), 1);
    assert_eq!(processor.calls(), 2);
    assert_eq!(observer.success.load(Ordering::SeqCst), 2);
    assert_eq!(observer.dlq.load(Ordering::SeqCst), 0);
    assert!(sink.accepted().is_empty());
    assert!(dedup.is_duplicate("a").await);
    assert!(dedup.is_duplicate("b").await);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let source = MemorySource::new();
    source.push_batch(vec![job("flaky", 0)]);

    let processor = Arc::new(ScriptedProcessor::failing_first(2));
    let sink = Arc::new(RecordingSink::accepting());
    let dedup = Arc::new(LruDedupStore::new(64));

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dedup = Some(dedup.clone());
    builder.dispatcher_config.max_retries = 3;
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    assert_eq!(processor.calls(), 3);
    assert_eq!(handle.commits(), 1);
    assert_eq!(observer.success.load(Ordering::SeqCst), 1);
    assert!(sink.accepted().is_empty());
    assert!(dedup.is_duplicate("flaky").await);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_still_commit() {
    let source = MemorySource::new();
    source.push_batch(vec![job("poison", 0)]);

    let processor = Arc::new(ScriptedProcessor::always_failing());
    let sink = Arc::new(RecordingSink::accepting());
    let dedup = Arc::new(LruDedupStore::new(64));

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dedup = Some(dedup.clone());
    builder.dispatcher_config.max_retries = 2;
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    assert_eq!(processor.calls(), 2);
    let accepted = sink.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].0, b"poison");
    assert_eq!(accepted[0].1, 2);
    assert!(accepted[0].2.as_deref().unwrap().contains("simulated"));
    assert_eq!(handle.commits(), 1);
    assert_eq!(observer.dlq.load(Ordering::SeqCst), 1);
    assert_eq!(observer.dlq_routed.load(Ordering::SeqCst), 1);
    // Dead-lettered jobs are never marked as processed.
    assert!(!dedup.is_duplicate("poison").await);
}

#[tokio::test]
async fn single_attempt_produces_one_record_and_one_ack() {
    let source = MemorySource::new();
    source.push_batch(vec![job("poison", 0)]);

    let processor = Arc::new(ScriptedProcessor::always_failing());
    let sink = Arc::new(RecordingSink::accepting());

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dispatcher_config.num_workers = 1;
    builder.dispatcher_config.max_retries = 1;
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    pipeline.finish().await.expect("clean drain");

    assert_eq!(processor.calls(), 1);
    assert_eq!(sink.accepted().len(), 1);
    assert_eq!(handle.commits(), 1);
}

#[tokio::test]
async fn broken_sink_without_fallback_blocks_commit() {
    let source = MemorySource::new();
    source.push_batch(vec![job("poison", 0)]);

    let processor = Arc::new(ScriptedProcessor::always_failing());
    let sink = Arc::new(RecordingSink::broken());

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dispatcher_config.max_retries = 1;
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();

    let sink_probe = sink.clone();
    eventually("sink exhaustion recorded", || {
        observer.sink_errors.load(Ordering::SeqCst) == 1 && sink_probe.calls() == 1
    })
    .await;

    // The latch never closed, so no ack and no commit; cancellation is the
    // only way out and must not commit either.
    assert_eq!(handle.commits(), 0);
    let outcome = pipeline.cancel_and_finish().await;
    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
    assert_eq!(handle.commits(), 0);
    assert_eq!(observer.dlq.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fallback_sink_rescues_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let fallback_path = dir.path().join("dlq-fallback.jsonl");

    let source = MemorySource::new();
    source.push_batch(vec![job("poison", 0)]);

    let processor = Arc::new(ScriptedProcessor::always_failing());
    let sink = Arc::new(RecordingSink::broken());

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink.clone());
    builder.dispatcher_config.max_retries = 2;
    builder.handler_config.max_sink_retries = 1;
    builder.fallback = Some(Arc::new(FallbackFileSink::new(&fallback_path)));
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    // Primary tried 1 + max_sink_retries times, then the fallback accepted.
    assert_eq!(sink.calls(), 2);
    assert_eq!(observer.sink_errors.load(Ordering::SeqCst), 1);
    assert_eq!(handle.commits(), 1);

    let data = std::fs::read_to_string(&fallback_path).unwrap();
    let lines: Vec<&str> = data.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: FallbackRecord = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record.attempts, 2);
    assert!(record.error.as_deref().unwrap().contains("simulated"));
    assert_eq!(record.topic, "documents.raw");
}

#[tokio::test]
async fn failing_fallback_also_blocks_commit() {
    let source = MemorySource::new();
    source.push_batch(vec![job("poison", 0)]);

    let processor = Arc::new(ScriptedProcessor::always_failing());
    let sink = Arc::new(RecordingSink::broken());
    let fallback = Arc::new(RecordingSink::broken());

    let mut builder = PipelineBuilder::new(source, processor, sink);
    builder.dispatcher_config.max_retries = 1;
    builder.fallback = Some(fallback.clone());
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let fallback_probe = fallback.clone();
    eventually("fallback attempted", || fallback_probe.calls() == 1).await;

    assert_eq!(handle.commits(), 0);
    let outcome = pipeline.cancel_and_finish().await;
    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
    assert_eq!(handle.commits(), 0);
}

#[tokio::test]
async fn ack_timeout_skips_commit_and_redelivers() {
    let source = MemorySource::new();
    source.push_batch(vec![job("slow", 0)]);

    let processor = Arc::new(ScriptedProcessor::slow_first_call(Duration::from_millis(400)));
    let sink = Arc::new(RecordingSink::accepting());

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink);
    builder.consumer_options.ack_timeout = Some(Duration::from_millis(50));
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    pipeline.finish().await.expect("clean drain");

    // First delivery timed out (no commit), the re-delivery succeeded.
    assert!(handle.polls() >= 2, "expected a re-poll, got {}", handle.polls());
    assert_eq!(handle.commits(), 1);
    assert!(processor.calls() >= 1);
}

#[tokio::test]
async fn batch_deadline_skips_commit_when_workers_stall() {
    let source = MemorySource::new();
    source.push_batch(vec![job("wedge", 0), job("x", 1), job("y", 2)]);

    // One worker wedged forever on the first job with a single-slot queue:
    // the batch cannot finish inside the deadline.
    let processor = Arc::new(ScriptedProcessor::slow_first_call(Duration::from_secs(600)));
    let sink = Arc::new(RecordingSink::accepting());

    let mut builder = PipelineBuilder::new(source, processor, sink);
    builder.dispatcher_config.num_workers = 1;
    builder.dispatcher_config.job_buffer = 1;
    builder.consumer_options.max_batch_wait = Some(Duration::from_millis(100));
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    eventually("deadline passes twice", || handle.polls() >= 2).await;

    assert_eq!(handle.commits(), 0);
    let outcome = pipeline.cancel_and_finish().await;
    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
    assert_eq!(handle.commits(), 0);
}

#[tokio::test]
async fn straggler_acks_do_not_satisfy_later_batches() {
    let source = MemorySource::new();
    source.push_batch(vec![job("j1", 0), job("j2", 1)]);
    let handle = source.handle();

    // Drive the consumer directly over hand-built queues so a scripted peer
    // can control exactly which generation every ack carries.
    let (jobs_tx, jobs_rx) = async_channel::bounded::<Dispatched>(4);
    let (acks_tx, acks_rx) = async_channel::bounded::<Ack>(8);

    let peer = tokio::spawn(async move {
        // Generation 1: only one of the two jobs acks before the deadline.
        let d1 = jobs_rx.recv().await.unwrap();
        let _d2 = jobs_rx.recv().await.unwrap();
        acks_tx.send(Ack { batch: d1.batch }).await.unwrap();

        // Generation 2 (re-delivery): nothing but stragglers from the
        // abandoned generation. If these counted, the batch would commit
        // with none of its own jobs finished.
        let d3 = jobs_rx.recv().await.unwrap();
        let _d4 = jobs_rx.recv().await.unwrap();
        assert_ne!(d3.batch, d1.batch);
        acks_tx.send(Ack { batch: d1.batch }).await.unwrap();
        acks_tx.send(Ack { batch: d1.batch }).await.unwrap();

        // Generation 3: real acks; only now may the batch commit.
        let d5 = jobs_rx.recv().await.unwrap();
        let d6 = jobs_rx.recv().await.unwrap();
        acks_tx.send(Ack { batch: d5.batch }).await.unwrap();
        acks_tx.send(Ack { batch: d6.batch }).await.unwrap();
    });

    let consumer =
        SourceConsumer::new(Box::new(source), jobs_tx, acks_rx).with_options(ConsumerOptions {
            max_batch_wait: Some(Duration::from_millis(100)),
            ..ConsumerOptions::default()
        });
    tokio::time::timeout(
        Duration::from_secs(5),
        consumer.run(CancellationToken::new()),
    )
    .await
    .expect("consumer did not finish")
    .expect("clean drain");

    // Two abandoned generations, one committed one, one closing poll.
    assert_eq!(handle.commits(), 1);
    assert_eq!(handle.polls(), 4);
    peer.await.unwrap();
}

#[tokio::test]
async fn marked_keys_skip_processing_on_redelivery() {
    let source = MemorySource::new();
    source.push_batch(vec![job("dup", 0)]);
    source.push_batch(vec![job("dup", 1)]);

    let processor = Arc::new(ScriptedProcessor::succeeding());
    let sink = Arc::new(RecordingSink::accepting());
    let dedup = Arc::new(LruDedupStore::new(64));

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink);
    builder.dedup = Some(dedup);
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    // Second delivery acked without touching the processor.
    assert_eq!(processor.calls(), 1);
    assert_eq!(observer.success.load(Ordering::SeqCst), 1);
    assert_eq!(observer.dedup_skipped.load(Ordering::SeqCst), 1);
    assert_eq!(handle.commits(), 2);
}

#[tokio::test]
async fn empty_keys_dedup_by_origin_coordinates() {
    let source = MemorySource::new();
    // Same coordinates delivered twice, as after a skipped commit.
    source.push_batch(vec![job("", 5)]);
    source.push_batch(vec![job("", 5)]);

    let processor = Arc::new(ScriptedProcessor::succeeding());
    let sink = Arc::new(RecordingSink::accepting());
    let dedup = Arc::new(LruDedupStore::new(64));

    let mut builder = PipelineBuilder::new(source, processor.clone(), sink);
    builder.dedup = Some(dedup.clone());
    let pipeline = builder.start();

    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    assert_eq!(processor.calls(), 1);
    assert_eq!(observer.dedup_skipped.load(Ordering::SeqCst), 1);
    assert!(dedup.is_duplicate("documents.raw:0:5").await);
}

#[tokio::test]
async fn every_job_produces_exactly_one_ack() {
    let source = MemorySource::new();
    let batch: Vec<Job> = (0..20).map(|i| job(&format!("k{i}"), i)).collect();
    source.push_batch(batch);

    // Odd-numbered calls fail once each; everything still terminates.
    let processor = Arc::new(ScriptedProcessor::failing_first(5));
    let sink = Arc::new(RecordingSink::accepting());

    let mut builder = PipelineBuilder::new(source, processor, sink.clone());
    builder.dispatcher_config.num_workers = 4;
    builder.dispatcher_config.max_retries = 2;
    // Queues sized past the batch so the consumer's send phase cannot jam
    // against a full ack queue.
    builder.dispatcher_config.job_buffer = 32;
    let pipeline = builder.start();

    let handle = pipeline.source.clone();
    let observer = pipeline.observer.clone();
    pipeline.finish().await.expect("clean drain");

    // 20 jobs, 20 terminal outcomes, exactly one commit: the ack count
    // matched the batch size with nothing double-acked.
    let total = observer.success.load(Ordering::SeqCst)
        + observer.dlq.load(Ordering::SeqCst)
        + observer.dedup_skipped.load(Ordering::SeqCst);
    assert_eq!(total, 20);
    assert_eq!(handle.commits(), 1);
    assert_eq!(
        observer.dlq.load(Ordering::SeqCst),
        sink.accepted().len()
    );
}
