use crate::app::ports::{DownstreamQueue, EnqueueOutcome};
use crate::envelope::Envelope;
use crate::error::QueueError;
use async_trait::async_trait;
use tracing::info;

/// Acknowledges every envelope after logging it. Used when no downstream URL
/// is configured.
pub struct LogOnlyQueue;

#[async_trait]
impl DownstreamQueue for LogOnlyQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            workspace = %envelope.workspace_slug,
            correlation_id = %envelope.correlation_id(),
            source = %envelope.source,
            "event envelope dispatched (log only)"
        );
        Ok(EnqueueOutcome::Ack)
    }

    fn name(&self) -> &'static str {
        "log-only"
    }
}
