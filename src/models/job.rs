//! A unit of work pulled from the partitioned source log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Record headers. Ordering is irrelevant; keys are case-sensitive.
pub type Headers = HashMap<String, String>;

/// Path of the document inside its originating repository.
pub const HEADER_FILE_PATH: &str = "file_path";
/// Kind of document (e.g. `source_code`, `markdown`).
pub const HEADER_SOURCE_TYPE: &str = "source_type";
/// Originating repository identifier.
pub const HEADER_REPOSITORY: &str = "repository";
/// Commit the document was captured at.
pub const HEADER_COMMIT_SHA: &str = "commit_sha";
/// W3C Trace Context propagation header.
pub const HEADER_TRACEPARENT: &str = "traceparent";

/// One raw-document record delivered by the source.
///
/// Created when the consumer receives a record; dropped once the worker has
/// acknowledged it.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque record key, possibly empty.
    pub key: Vec<u8>,
    /// Opaque record payload.
    pub value: Vec<u8>,
    /// Source topic the record came from.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record headers.
    pub headers: Headers,
    /// Timestamp assigned by the producer.
    pub timestamp: DateTime<Utc>,
}

impl Job {
    /// Canonical identity used by the dedup store.
    ///
    /// The key bytes are used verbatim when present; records without a key
    /// fall back to their origin coordinates, which are unique per record.
    pub fn dedup_key(&self) -> String {
        if self.key.is_empty() {
            format!("{}:{}:{}", self.topic, self.partition, self.offset)
        } else {
            String::from_utf8_lossy(&self.key).into_owned()
        }
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
