//! Spool-backed DLQ producer: the primary dead-letter sink.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

use super::SpoolRecord;
use crate::models::{Headers, JobResult};
use crate::sink::{
    DlqSink, DLQ_HEADER_ATTEMPTS, DLQ_HEADER_ERROR, DLQ_HEADER_FAILED_AT,
    DLQ_HEADER_SOURCE_OFFSET, DLQ_HEADER_SOURCE_PARTITION, DLQ_HEADER_SOURCE_TOPIC,
};

/// Dead-letter records all land on partition 0 of the DLQ topic; ordering
/// across failed records is not meaningful.
const DLQ_PARTITION: i32 = 0;

/// Appends dead-letter records to a spool topic in the broker DLQ format:
/// original key and value bytes, original headers, plus the origin
/// coordinates and failure metadata.
pub struct SpoolDlqProducer {
    root: PathBuf,
    topic: String,
}

impl SpoolDlqProducer {
    pub fn new(root: impl Into<PathBuf>, topic: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DlqSink for SpoolDlqProducer {
    async fn send(&self, result: &JobResult) -> anyhow::Result<()> {
        let job = &result.job;

        let mut headers: Headers = job.headers.clone();
        headers.insert(DLQ_HEADER_SOURCE_TOPIC.to_string(), job.topic.clone());
        headers.insert(
            DLQ_HEADER_SOURCE_PARTITION.to_string(),
            job.partition.to_string(),
        );
        headers.insert(DLQ_HEADER_SOURCE_OFFSET.to_string(), job.offset.to_string());
        headers.insert(DLQ_HEADER_ATTEMPTS.to_string(), result.attempts.to_string());
        headers.insert(DLQ_HEADER_FAILED_AT.to_string(), Utc::now().to_rfc3339());
        if let Some(message) = result.error_message() {
            headers.insert(DLQ_HEADER_ERROR.to_string(), message);
        }

        let record = SpoolRecord::from_parts(&job.key, &job.value, headers, job.timestamp);
        super::append(&self.root, &self.topic, DLQ_PARTITION, &record)
    }
}
