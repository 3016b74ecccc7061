//! Prometheus-backed observer.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

use super::{JobOutcome, Observer};

/// Observer backed by a dedicated prometheus [`Registry`].
///
/// Counters and gauges are atomics underneath, so recording from every
/// worker concurrently is fine.
pub struct PrometheusObserver {
    registry: Registry,
    jobs_processed: IntCounterVec,
    dlq_routed: IntCounter,
    dlq_sink_errors: IntCounter,
    batch_duration: Histogram,
    consumer_lag: IntGaugeVec,
}

impl PrometheusObserver {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_processed = IntCounterVec::new(
            Opts::new(
                "docrelay_jobs_processed_total",
                "Jobs that reached a terminal state, by outcome",
            ),
            &["outcome"],
        )?;
        let dlq_routed = IntCounter::new(
            "docrelay_dlq_routed_total",
            "Failed jobs routed to the dead-letter queue",
        )?;
        let dlq_sink_errors = IntCounter::new(
            "docrelay_dlq_sink_errors_total",
            "Primary DLQ sink retry exhaustions",
        )?;
        let batch_duration = Histogram::with_opts(HistogramOpts::new(
            "docrelay_batch_duration_seconds",
            "Wall-clock duration of one poll-to-terminal batch cycle",
        ))?;
        let consumer_lag = IntGaugeVec::new(
            Opts::new(
                "docrelay_consumer_lag",
                "Records between the last delivered offset and the high watermark",
            ),
            &["topic", "partition"],
        )?;

        registry.register(Box::new(jobs_processed.clone()))?;
        registry.register(Box::new(dlq_routed.clone()))?;
        registry.register(Box::new(dlq_sink_errors.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;
        registry.register(Box::new(consumer_lag.clone()))?;

        Ok(Self {
            registry,
            jobs_processed,
            dlq_routed,
            dlq_sink_errors,
            batch_duration,
            consumer_lag,
        })
    }

    /// The registry the metrics endpoint serves from.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }
}

impl Observer for PrometheusObserver {
    fn record_job_processed(&self, outcome: JobOutcome) {
        self.jobs_processed
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    fn record_dlq_routed(&self) {
        self.dlq_routed.inc();
    }

    fn record_dlq_sink_error(&self) {
        self.dlq_sink_errors.inc();
    }

    fn record_batch_duration(&self, seconds: f64) {
        self.batch_duration.observe(seconds);
    }

    fn record_consumer_lag(&self, topic: &str, partition: i32, lag: i64) {
        self.consumer_lag
            .with_label_values(&[topic, &partition.to_string()])
            .set(lag);
    }
}
