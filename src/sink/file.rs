//! JSONL fallback sink: last resort when the primary DLQ sink is down.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DlqSink;
use crate::models::{Headers, JobResult};

// Appends from every sink instance in the process go through one lock so a
// line is always a single contiguous write.
static APPEND_LOCK: Mutex<()> = Mutex::new(());

/// One fallback line. Byte fields are base64.
#[derive(Debug, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub key: String,
    pub value: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: Headers,
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub written_at: DateTime<Utc>,
}

/// Appends failed results to a local JSONL file, one object per line.
pub struct FallbackFileSink {
    path: PathBuf,
}

impl FallbackFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DlqSink for FallbackFileSink {
    async fn send(&self, result: &JobResult) -> anyhow::Result<()> {
        let job = &result.job;
        let record = FallbackRecord {
            key: B64.encode(&job.key),
            value: B64.encode(&job.value),
            topic: job.topic.clone(),
            partition: job.partition,
            offset: job.offset,
            headers: job.headers.clone(),
            error: result.error_message(),
            attempts: result.attempts,
            timestamp: job.timestamp,
            written_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record).context("serializing fallback record")?;
        line.push('\n');

        let _guard = APPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening fallback file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to fallback file {}", self.path.display()))?;
        Ok(())
    }
}
