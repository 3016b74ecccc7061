//! Worker configuration shared across the pipeline components.

use std::time::Duration;

use crate::pipeline::{ConsumerOptions, DispatcherConfig, DlqHandlerConfig};

/// Fully resolved worker settings. Built by the CLI layer from flags and
/// environment variables; every component reads its slice through the
/// conversion helpers below.
#[derive(Debug, Clone)]
pub struct Settings {
    pub num_workers: usize,
    /// Total processing attempts per job, including the first.
    pub max_retries: u32,
    /// Work queue capacity; 0 derives `2 * num_workers`.
    pub job_buffer: usize,
    /// DLQ queue capacity; 0 derives `num_workers`.
    pub dlq_buffer: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub ack_timeout: Option<Duration>,
    pub max_batch_wait: Option<Duration>,
    pub dlq_ack_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub health_threshold: u32,
    pub max_sink_retries: u32,
    pub sink_retry_delay: Duration,
    /// How stale the last batch cycle may be before the liveness probe
    /// reports unhealthy.
    pub liveness_threshold: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_retries: 3,
            job_buffer: 0,
            dlq_buffer: 0,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            ack_timeout: None,
            max_batch_wait: None,
            dlq_ack_timeout: None,
            job_timeout: None,
            health_threshold: 3,
            max_sink_retries: 3,
            sink_retry_delay: Duration::from_secs(1),
            liveness_threshold: Duration::from_secs(45),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_workers == 0 {
            anyhow::bail!("num_workers must be at least 1");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.health_threshold == 0 {
            anyhow::bail!("health_threshold must be at least 1");
        }
        if self.max_backoff < self.base_backoff {
            anyhow::bail!("max_backoff must not be smaller than base_backoff");
        }
        Ok(())
    }

    pub fn job_buffer(&self) -> usize {
        if self.job_buffer == 0 {
            self.num_workers * 2
        } else {
            self.job_buffer
        }
    }

    pub fn dlq_buffer(&self) -> usize {
        if self.dlq_buffer == 0 {
            self.num_workers
        } else {
            self.dlq_buffer
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            num_workers: self.num_workers,
            max_retries: self.max_retries,
            job_buffer: self.job_buffer(),
            dlq_buffer: self.dlq_buffer(),
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            dlq_ack_timeout: self.dlq_ack_timeout,
            job_timeout: self.job_timeout,
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            ack_timeout: self.ack_timeout,
            max_batch_wait: self.max_batch_wait,
            health_threshold: self.health_threshold,
        }
    }

    pub fn dlq_handler_config(&self) -> DlqHandlerConfig {
        DlqHandlerConfig {
            max_sink_retries: self.max_sink_retries,
            retry_delay: self.sink_retry_delay,
        }
    }
}
