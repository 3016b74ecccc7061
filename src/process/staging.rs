//! Staging writer: lands documents in a content-addressed directory tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::Processor;
use crate::models::{Headers, Job};

/// Origin metadata written beside each staged document.
#[derive(Serialize)]
struct StagedMeta<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    headers: &'a Headers,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Writes each document under `{dir}/{hash[0..2]}/{hash[0..16]}.raw` with a
/// JSON metadata sidecar. Re-delivery of an already-staged document is a
/// no-op, so the writer is idempotent under at-least-once delivery.
pub struct StagingWriter {
    dir: PathBuf,
}

impl StagingWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn content_path(&self, hash: &str) -> PathBuf {
        self.dir.join(&hash[..2]).join(format!("{}.raw", &hash[..16]))
    }
}

#[async_trait]
impl Processor for StagingWriter {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let hash = hex::encode(Sha256::digest(&job.value));
        let content_path = self.content_path(&hash);
        if content_path.exists() {
            return Ok(());
        }

        let parent = content_path
            .parent()
            .context("content path has no parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating staging dir {}", parent.display()))?;

        write_atomic(&content_path, &job.value)?;

        let meta = StagedMeta {
            topic: &job.topic,
            partition: job.partition,
            offset: job.offset,
            headers: &job.headers,
            timestamp: job.timestamp,
        };
        let meta_path = content_path.with_extension("json");
        let body = serde_json::to_vec_pretty(&meta).context("serializing staging metadata")?;
        write_atomic(&meta_path, &body)?;
        Ok(())
    }
}

/// Write via temp file + rename so partial writes never surface.
fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}
