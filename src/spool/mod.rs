//! File-backed partitioned log ("spool").
//!
//! A topic is a directory under the spool root; partition `n` is the segment
//! file `p-n.log`, one JSON record per line, offsets implied by line number.
//! Committed consumer offsets live in `offsets.json` beside the segments.
//!
//! The spool is the default source and DLQ backend: it gives the worker real
//! partitioned-log semantics (ordered offsets, manual commit, re-delivery of
//! uncommitted batches) without an external broker.

mod producer;
mod source;

pub use producer::SpoolDlqProducer;
pub use source::{SpoolSource, SpoolSourceConfig};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Headers;

const SEGMENT_PREFIX: &str = "p-";
const SEGMENT_SUFFIX: &str = ".log";
const OFFSETS_FILE: &str = "offsets.json";

/// One record on a spool segment. Byte fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    /// Record key, base64. Absent and empty are equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Record payload, base64.
    pub value: String,
    #[serde(default)]
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

impl SpoolRecord {
    pub fn from_parts(
        key: &[u8],
        value: &[u8],
        headers: Headers,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key: if key.is_empty() {
                None
            } else {
                Some(B64.encode(key))
            },
            value: B64.encode(value),
            headers,
            timestamp,
        }
    }

    pub fn key_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match &self.key {
            Some(k) => B64.decode(k).context("invalid base64 record key"),
            None => Ok(Vec::new()),
        }
    }

    pub fn value_bytes(&self) -> anyhow::Result<Vec<u8>> {
        B64.decode(&self.value).context("invalid base64 record value")
    }
}

pub fn topic_dir(root: &Path, topic: &str) -> PathBuf {
    root.join(topic)
}

pub fn segment_path(root: &Path, topic: &str, partition: i32) -> PathBuf {
    topic_dir(root, topic).join(format!("{SEGMENT_PREFIX}{partition}{SEGMENT_SUFFIX}"))
}

/// Partitions present on disk for a topic, sorted. A missing topic directory
/// is just an empty topic.
pub fn list_partitions(root: &Path, topic: &str) -> anyhow::Result<Vec<i32>> {
    let dir = topic_dir(root, topic);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading topic dir {}", dir.display())),
    };

    let mut partitions = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(partition) = stem.parse::<i32>() {
                partitions.push(partition);
            }
        }
    }
    partitions.sort_unstable();
    Ok(partitions)
}

/// Read all lines of a partition segment. Missing segment reads as empty.
pub fn read_segment(root: &Path, topic: &str, partition: i32) -> anyhow::Result<Vec<String>> {
    let path = segment_path(root, topic, partition);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening segment {}", path.display())),
    };
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading segment {}", path.display()))?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Append one record to a partition segment as a single line write.
pub fn append(root: &Path, topic: &str, partition: i32, record: &SpoolRecord) -> anyhow::Result<()> {
    let path = segment_path(root, topic, partition);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating topic dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serializing spool record")?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening segment {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("appending to segment {}", path.display()))?;
    Ok(())
}

/// Load committed offsets for a topic. Missing file means nothing committed.
pub fn read_offsets(root: &Path, topic: &str) -> anyhow::Result<HashMap<i32, i64>> {
    let path = topic_dir(root, topic).join(OFFSETS_FILE);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).with_context(|| format!("reading offsets {}", path.display())),
    };
    let raw: BTreeMap<String, i64> =
        serde_json::from_str(&data).with_context(|| format!("parsing offsets {}", path.display()))?;
    let mut offsets = HashMap::new();
    for (partition, offset) in raw {
        let partition = partition
            .parse::<i32>()
            .with_context(|| format!("bad partition key {partition:?} in {}", path.display()))?;
        offsets.insert(partition, offset);
    }
    Ok(offsets)
}

/// Persist committed offsets atomically (temp file + rename).
pub fn write_offsets(root: &Path, topic: &str, offsets: &HashMap<i32, i64>) -> anyhow::Result<()> {
    let dir = topic_dir(root, topic);
    fs::create_dir_all(&dir).with_context(|| format!("creating topic dir {}", dir.display()))?;

    let raw: BTreeMap<String, i64> = offsets
        .iter()
        .map(|(partition, offset)| (partition.to_string(), *offset))
        .collect();
    let data = serde_json::to_string_pretty(&raw).context("serializing offsets")?;

    let path = dir.join(OFFSETS_FILE);
    let tmp = dir.join(format!("{OFFSETS_FILE}.tmp"));
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}
