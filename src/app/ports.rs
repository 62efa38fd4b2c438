use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::QueueError;

/// What the downstream queue said about one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Ack,
    Reject(String),
}

/// The downstream work queue the dispatcher feeds.
///
/// Delivery is at-least-once: the same envelope can be offered again after a
/// crash or a lost acknowledgement, so implementations are expected to dedup
/// on `metadata.idempotencyKey` or tolerate repeats.
#[async_trait]
pub trait DownstreamQueue: Send + Sync {
    async fn enqueue(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError>;

    fn name(&self) -> &'static str;
}
