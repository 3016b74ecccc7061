//! HTTP forwarder: ships each document to a downstream service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::Instrument;

use super::Processor;
use crate::models::{
    Job, HEADER_COMMIT_SHA, HEADER_FILE_PATH, HEADER_REPOSITORY, HEADER_SOURCE_TYPE,
    HEADER_TRACEPARENT,
};
use crate::trace::{self, TraceContext};

/// Document headers forwarded to the downstream, with their HTTP names.
const FORWARDED_HEADERS: [(&str, &str); 4] = [
    (HEADER_FILE_PATH, "x-doc-file-path"),
    (HEADER_SOURCE_TYPE, "x-doc-source-type"),
    (HEADER_REPOSITORY, "x-doc-repository"),
    (HEADER_COMMIT_SHA, "x-doc-commit-sha"),
];

/// POSTs the raw document body downstream, propagating trace context and the
/// recognized document headers. Any non-success status is an error.
pub struct HttpForwarder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpForwarder {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building forwarder HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Processor for HttpForwarder {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let span = trace::forward_span(job);
        async {
            // Continue the record's trace when it carries one.
            let cx = trace::extract(&job.headers)
                .map(|cx| cx.child())
                .unwrap_or_else(TraceContext::generate);

            let mut request = self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(HEADER_TRACEPARENT, cx.to_traceparent())
                .body(job.value.clone());
            for (header, http_name) in FORWARDED_HEADERS {
                if let Some(value) = job.header(header) {
                    request = request.header(http_name, value);
                }
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("forwarding to {}", self.endpoint))?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("downstream returned {status}");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}
