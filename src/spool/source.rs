//! Spool-backed implementation of the source port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use super::SpoolRecord;
use crate::models::Job;
use crate::source::{JobSource, LagReporter, SourceError};

/// Tuning for a [`SpoolSource`].
#[derive(Debug, Clone)]
pub struct SpoolSourceConfig {
    /// Upper bound on records delivered per partition per poll.
    pub max_poll_records: usize,
    /// When true, an exhausted spool is tailed instead of closing the source.
    pub follow: bool,
    /// Re-scan interval while tailing.
    pub poll_interval: Duration,
}

impl Default for SpoolSourceConfig {
    fn default() -> Self {
        Self {
            max_poll_records: 100,
            follow: false,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Reads a spool topic as a partitioned log with manual commit.
///
/// `poll` always scans from the committed offsets, so a batch whose commit
/// was skipped is delivered again on the next poll. `commit` persists the
/// offsets covered by the most recent poll.
pub struct SpoolSource {
    root: PathBuf,
    topic: String,
    config: SpoolSourceConfig,
    /// Next offset to read, per partition. Mirrors `offsets.json`.
    committed: HashMap<i32, i64>,
    /// Next offset after the last polled batch, per partition.
    delivered: HashMap<i32, i64>,
    /// High watermarks observed during the last scan.
    watermarks: HashMap<(String, i32), i64>,
}

impl SpoolSource {
    /// Open a topic under the spool root, restoring committed offsets.
    pub fn open(
        root: impl Into<PathBuf>,
        topic: impl Into<String>,
        config: SpoolSourceConfig,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        let topic = topic.into();
        let committed = super::read_offsets(&root, &topic)
            .with_context(|| format!("restoring offsets for topic {topic}"))?;
        Ok(Self {
            root,
            topic,
            config,
            committed,
            delivered: HashMap::new(),
            watermarks: HashMap::new(),
        })
    }

    /// One pass over the segment files, collecting uncommitted records.
    fn scan(&mut self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = Vec::new();
        self.delivered.clear();

        for partition in super::list_partitions(&self.root, &self.topic)? {
            let lines = super::read_segment(&self.root, &self.topic, partition)?;
            self.watermarks
                .insert((self.topic.clone(), partition), lines.len() as i64);

            let start = self.committed.get(&partition).copied().unwrap_or(0).max(0) as usize;
            for (index, line) in lines
                .iter()
                .enumerate()
                .skip(start)
                .take(self.config.max_poll_records)
            {
                let record: SpoolRecord = serde_json::from_str(line).with_context(|| {
                    format!(
                        "malformed record at {}:{partition}:{index}",
                        self.topic
                    )
                })?;
                jobs.push(Job {
                    key: record.key_bytes()?,
                    value: record.value_bytes()?,
                    topic: self.topic.clone(),
                    partition,
                    offset: index as i64,
                    headers: record.headers,
                    timestamp: record.timestamp,
                });
                self.delivered.insert(partition, index as i64 + 1);
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobSource for SpoolSource {
    async fn poll(&mut self) -> Result<Vec<Job>, SourceError> {
        loop {
            let jobs = self.scan()?;
            if !jobs.is_empty() {
                return Ok(jobs);
            }
            if !self.config.follow {
                return Err(SourceError::Closed);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        for (partition, next) in self.delivered.drain() {
            let slot = self.committed.entry(partition).or_insert(0);
            if next > *slot {
                *slot = next;
            }
        }
        super::write_offsets(&self.root, &self.topic, &self.committed)
            .with_context(|| format!("committing offsets for topic {}", self.topic))
    }

    async fn close(&mut self) {}

    fn lag_reporter(&self) -> Option<&dyn LagReporter> {
        Some(self)
    }
}

impl LagReporter for SpoolSource {
    fn high_water_marks(&self) -> HashMap<(String, i32), i64> {
        self.watermarks.clone()
    }
}
