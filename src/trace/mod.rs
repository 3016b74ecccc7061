//! Distributed-trace continuity across pipeline stages.
//!
//! Trace context propagates through record headers in the W3C Trace Context
//! `traceparent` format (`{version}-{trace_id}-{span_id}-{flags}`). Spans are
//! emitted through the `tracing` facade; the subscriber installed by the
//! binary decides where they go.

use tracing::{info_span, Span};
use uuid::Uuid;

use crate::models::{Headers, Job, HEADER_TRACEPARENT};

const SUPPORTED_VERSION: &str = "00";

/// Parsed W3C trace context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex chars, not all zero.
    pub trace_id: String,
    /// 16 lowercase hex chars, not all zero.
    pub span_id: String,
    /// Sampled flag from the trace-flags octet.
    pub sampled: bool,
}

impl TraceContext {
    /// Parse a `traceparent` header value. Returns `None` on anything
    /// malformed rather than guessing.
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() != 4 || parts[0] != SUPPORTED_VERSION {
            return None;
        }
        let (trace_id, span_id, flags) = (parts[1], parts[2], parts[3]);
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
        })
    }

    /// Render back to a `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!(
            "{}-{}-{}-{}",
            SUPPORTED_VERSION, self.trace_id, self.span_id, flags
        )
    }

    /// Start a brand-new sampled trace.
    pub fn generate() -> Self {
        Self {
            trace_id: Uuid::new_v4().as_simple().to_string(),
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Derive a child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            sampled: self.sampled,
        }
    }
}

fn new_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}

/// Extract the inbound trace context from record headers.
pub fn extract(headers: &Headers) -> Option<TraceContext> {
    headers
        .get(HEADER_TRACEPARENT)
        .and_then(|v| TraceContext::parse(v))
}

/// Inject a trace context into outbound headers.
pub fn inject(cx: &TraceContext, headers: &mut Headers) {
    headers.insert(HEADER_TRACEPARENT.to_string(), cx.to_traceparent());
}

/// Span covering one source poll.
pub fn poll_span() -> Span {
    info_span!("source.poll")
}

/// Span covering one offset commit.
pub fn commit_span() -> Span {
    info_span!("source.commit")
}

/// Span covering the processing of one job, linked to the inbound trace
/// context when the record carried one.
pub fn process_span(job: &Job, cx: Option<&TraceContext>) -> Span {
    let span = info_span!(
        "job.process",
        topic = %job.topic,
        partition = job.partition,
        offset = job.offset,
        trace_id = tracing::field::Empty,
        parent_span_id = tracing::field::Empty,
    );
    if let Some(cx) = cx {
        span.record("trace_id", cx.trace_id.as_str());
        span.record("parent_span_id", cx.span_id.as_str());
    }
    span
}

/// Span covering the downstream forward of one job.
pub fn forward_span(job: &Job) -> Span {
    info_span!(
        "job.forward",
        topic = %job.topic,
        partition = job.partition,
        offset = job.offset,
    )
}

/// Span covering the DLQ routing of one failed job.
pub fn dlq_span(job: &Job) -> Span {
    info_span!(
        "dlq.route",
        topic = %job.topic,
        partition = job.partition,
        offset = job.offset,
    )
}
