//! Shared liveness state bridging the consumer to the health endpoint.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

/// The worker is live when the consumer finished a batch cycle recently AND
/// is not in a run of consecutive ack timeouts past its health threshold.
pub struct HealthState {
    /// Epoch millis of the last completed batch cycle. Starts at
    /// construction time so a freshly started worker is live.
    last_batch_ms: AtomicI64,
    consumer_healthy: AtomicBool,
    liveness_threshold: Duration,
}

impl HealthState {
    pub fn new(liveness_threshold: Duration) -> Self {
        Self {
            last_batch_ms: AtomicI64::new(now_ms()),
            consumer_healthy: AtomicBool::new(true),
            liveness_threshold,
        }
    }

    /// Called by the consumer at the end of every batch cycle.
    pub fn record_batch(&self) {
        self.last_batch_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Called by the consumer whenever its timeout counter changes.
    pub fn set_consumer_healthy(&self, healthy: bool) {
        self.consumer_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        let age_ms = now_ms() - self.last_batch_ms.load(Ordering::Relaxed);
        age_ms <= self.liveness_threshold.as_millis() as i64
            && self.consumer_healthy.load(Ordering::Relaxed)
    }

    /// Seconds since the last completed batch cycle.
    pub fn seconds_since_last_batch(&self) -> f64 {
        (now_ms() - self.last_batch_ms.load(Ordering::Relaxed)) as f64 / 1000.0
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
