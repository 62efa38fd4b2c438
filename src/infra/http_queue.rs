use crate::app::ports::{DownstreamQueue, EnqueueOutcome};
use crate::envelope::Envelope;
use crate::error::QueueError;
use async_trait::async_trait;
use std::time::Duration;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Posts each envelope as JSON to a downstream worker endpoint
/// (for example the intelligence worker's `/v1/intelligence/process`).
///
/// 2xx is an acknowledgement; any other status is a rejection and the
/// dispatcher will retry. The idempotency key travels as a header so the
/// receiver can drop redelivered envelopes.
pub struct HttpDownstreamQueue {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstreamQueue {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DownstreamQueue for HttpDownstreamQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_KEY_HEADER, envelope.idempotency_key())
            .json(envelope);
        if !envelope.correlation_id().is_empty() {
            request = request.header(CORRELATION_ID_HEADER, envelope.correlation_id());
        }
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::Transport(format!("request to {} timed out", self.url))
            } else {
                QueueError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(EnqueueOutcome::Ack);
        }
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Ok(EnqueueOutcome::Reject(format!("HTTP {}: {}", status.as_u16(), snippet)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
