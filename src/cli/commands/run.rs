//! The `run` command: wire the pipeline and drain the spool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::dedup::{self, DedupBackend};
use crate::observe::server::ObserveState;
use crate::observe::{self, HealthState, PrometheusObserver};
use crate::pipeline::{DlqHandler, Dispatcher, PipelineError, SourceConsumer};
use crate::process::{HttpForwarder, Processor, StagingWriter};
use crate::sink::FallbackFileSink;
use crate::spool::{SpoolDlqProducer, SpoolSource, SpoolSourceConfig};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ProcessorKind {
    /// Land documents in a content-addressed staging directory
    Staging,
    /// POST documents to a downstream HTTP service
    Forward,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Spool root directory
    #[arg(long, env = "SPOOL_DIR", default_value = "./spool")]
    spool_dir: PathBuf,

    /// Source topic to consume
    #[arg(long, env = "SOURCE_TOPIC", default_value = "documents.raw")]
    topic: String,

    /// Dead-letter topic
    #[arg(long, env = "DLQ_TOPIC", default_value = "documents.dlq")]
    dlq_topic: String,

    /// Keep tailing the spool instead of exiting once it is drained
    #[arg(long, env = "FOLLOW")]
    follow: bool,

    /// Records delivered per partition per poll
    #[arg(long, env = "MAX_POLL_RECORDS", default_value_t = 100)]
    max_poll_records: usize,

    /// Worker tasks pulling from the work queue
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    num_workers: usize,

    /// Processing attempts per job, including the first
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Work queue capacity (0 = twice the worker count)
    #[arg(long, env = "JOB_BUFFER", default_value_t = 0)]
    job_buffer: usize,

    /// DLQ queue capacity (0 = the worker count)
    #[arg(long, env = "DLQ_BUFFER", default_value_t = 0)]
    dlq_buffer: usize,

    /// Base retry backoff in milliseconds
    #[arg(long, env = "BASE_BACKOFF", default_value_t = 100)]
    base_backoff_ms: u64,

    /// Backoff growth cap in milliseconds
    #[arg(long, env = "MAX_BACKOFF", default_value_t = 30_000)]
    max_backoff_ms: u64,

    /// Longest tolerated gap between acks of one batch, seconds (0 disables)
    #[arg(long, env = "ACK_TIMEOUT_SECONDS", default_value_t = 0)]
    ack_timeout_seconds: u64,

    /// Wall-clock bound on one batch's acks, seconds (0 disables)
    #[arg(long, env = "MAX_BATCH_WAIT_SECONDS", default_value_t = 0)]
    max_batch_wait_seconds: u64,

    /// Ack a DLQ'd job even if its latch never closes, seconds (0 disables).
    /// Only safe together with --dlq-fallback-path.
    #[arg(long, env = "DLQ_ACK_TIMEOUT_SECONDS", default_value_t = 0)]
    dlq_ack_timeout_seconds: u64,

    /// Per-job processing deadline, seconds (0 disables)
    #[arg(long, env = "JOB_TIMEOUT_SECONDS", default_value_t = 0)]
    job_timeout_seconds: u64,

    /// Consecutive batch timeouts before the consumer reports unhealthy
    #[arg(long, env = "HEALTH_THRESHOLD", default_value_t = 3)]
    health_threshold: u32,

    /// Extra DLQ sink attempts after the first
    #[arg(long, env = "MAX_SINK_RETRIES", default_value_t = 3)]
    max_sink_retries: u32,

    /// Pause between DLQ sink attempts, milliseconds
    #[arg(long, env = "SINK_RETRY_DELAY_MS", default_value_t = 1_000)]
    sink_retry_delay_ms: u64,

    /// Liveness threshold on batch staleness, seconds
    #[arg(long, env = "LIVENESS_THRESHOLD_SECONDS", default_value_t = 45)]
    liveness_threshold_seconds: u64,

    /// JSONL file for dead letters the DLQ topic would not accept
    #[arg(long, env = "DLQ_FALLBACK_PATH")]
    dlq_fallback_path: Option<PathBuf>,

    /// Dedup backend: memory, redis, or none
    #[arg(long, env = "DEDUP_STORE_TYPE", default_value = "memory")]
    dedup_store: String,

    /// Entries kept by the in-memory dedup store
    #[arg(long, env = "DEDUP_CAPACITY", default_value_t = 100_000)]
    dedup_capacity: usize,

    /// Expiry horizon for redis dedup entries, seconds
    #[arg(long, env = "DEDUP_TTL_SECONDS", default_value_t = 86_400)]
    dedup_ttl_seconds: u64,

    /// Redis connection URL for the redis dedup backend
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Metrics and liveness listen address
    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9464")]
    metrics_addr: SocketAddr,

    /// Processing stage to run each document through
    #[arg(long, env = "PROCESSOR", value_enum, default_value = "staging")]
    processor: ProcessorKind,

    /// Staging directory for the staging processor
    #[arg(long, env = "STAGING_DIR", default_value = "./staging")]
    staging_dir: PathBuf,

    /// Downstream endpoint for the forward processor
    #[arg(long, env = "FORWARD_URL")]
    forward_url: Option<String>,

    /// Forward request timeout, seconds
    #[arg(long, env = "FORWARD_TIMEOUT_SECONDS", default_value_t = 30)]
    forward_timeout_seconds: u64,
}

impl RunArgs {
    fn settings(&self) -> Settings {
        Settings {
            num_workers: self.num_workers,
            max_retries: self.max_retries,
            job_buffer: self.job_buffer,
            dlq_buffer: self.dlq_buffer,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ack_timeout: optional_secs(self.ack_timeout_seconds),
            max_batch_wait: optional_secs(self.max_batch_wait_seconds),
            dlq_ack_timeout: optional_secs(self.dlq_ack_timeout_seconds),
            job_timeout: optional_secs(self.job_timeout_seconds),
            health_threshold: self.health_threshold,
            max_sink_retries: self.max_sink_retries,
            sink_retry_delay: Duration::from_millis(self.sink_retry_delay_ms),
            liveness_threshold: Duration::from_secs(self.liveness_threshold_seconds),
        }
    }

    fn build_processor(&self) -> anyhow::Result<Arc<dyn Processor>> {
        match self.processor {
            ProcessorKind::Staging => Ok(Arc::new(StagingWriter::new(&self.staging_dir))),
            ProcessorKind::Forward => {
                let url = self
                    .forward_url
                    .clone()
                    .context("--forward-url is required with the forward processor")?;
                Ok(Arc::new(HttpForwarder::new(
                    url,
                    Duration::from_secs(self.forward_timeout_seconds),
                )?))
            }
        }
    }

    fn dedup_backend(&self) -> anyhow::Result<DedupBackend> {
        match self.dedup_store.as_str() {
            "none" => Ok(DedupBackend::Disabled),
            "memory" => Ok(DedupBackend::Memory {
                capacity: self.dedup_capacity,
            }),
            "redis" => Ok(DedupBackend::Redis {
                url: self.redis_url.clone(),
                ttl_seconds: self.dedup_ttl_seconds,
            }),
            other => anyhow::bail!("unknown dedup store type {other:?}"),
        }
    }
}

fn optional_secs(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let settings = args.settings();
    settings.validate()?;
    if settings.dlq_ack_timeout.is_some() && args.dlq_fallback_path.is_none() {
        warn!("dlq ack timeout configured without a fallback sink; a sink outage can lose records");
    }

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let observer = Arc::new(PrometheusObserver::new()?);
    let health = Arc::new(HealthState::new(settings.liveness_threshold));
    let observe_state = ObserveState {
        registry: observer.registry(),
        health: health.clone(),
    };
    let server = {
        let addr = args.metrics_addr;
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = observe::server::serve(addr, observe_state, token).await {
                tracing::error!(error = %format!("{e:#}"), "metrics endpoint failed");
            }
        })
    };

    let processor = args.build_processor()?;
    let dedup = dedup::build(args.dedup_backend()?).await?;

    let mut dispatcher = Dispatcher::new(processor, settings.dispatcher_config())
        .with_observer(observer.clone());
    if let Some(store) = dedup {
        dispatcher = dispatcher.with_dedup(store);
    }

    let sink = Arc::new(SpoolDlqProducer::new(&args.spool_dir, &args.dlq_topic));
    let mut handler = DlqHandler::new(dispatcher.dlq(), sink, settings.dlq_handler_config())
        .with_observer(observer.clone());
    if let Some(path) = &args.dlq_fallback_path {
        handler = handler.with_fallback(Arc::new(FallbackFileSink::new(path)));
    }

    let source = SpoolSource::open(
        &args.spool_dir,
        &args.topic,
        SpoolSourceConfig {
            max_poll_records: args.max_poll_records,
            follow: args.follow,
            ..SpoolSourceConfig::default()
        },
    )?;
    let consumer = SourceConsumer::new(Box::new(source), dispatcher.jobs(), dispatcher.acks())
        .with_observer(observer.clone())
        .with_options(settings.consumer_options())
        .with_health(health.clone());

    info!(
        topic = %args.topic,
        dlq_topic = %args.dlq_topic,
        workers = settings.num_workers,
        "worker starting"
    );

    let dispatcher_task = tokio::spawn(dispatcher.run(token.clone()));
    let handler_task = tokio::spawn(handler.run(token.clone()));

    let outcome = consumer.run(token.clone()).await;

    token.cancel();
    let _ = dispatcher_task.await;
    let _ = handler_task.await;
    let _ = server.await;

    match outcome {
        Ok(()) => {
            info!("spool drained; worker exiting");
            Ok(())
        }
        Err(PipelineError::Cancelled) => {
            info!("shutdown requested; worker exiting");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// First interrupt drains gracefully, a second one aborts the process.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut interrupts = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            if interrupts == 1 {
                info!("interrupt received; draining (press ctrl-c again to abort)");
                token.cancel();
            } else {
                warn!("second interrupt; aborting");
                std::process::exit(130);
            }
        }
    });
}
