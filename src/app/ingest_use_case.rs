use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::field::Empty;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{StoreError, ValidationError};
use crate::idempotency::{IdempotencyScope, IdempotencyStore, Reservation};
use crate::metrics::gateway as gateway_metrics;
use crate::staging::StagingLog;
use crate::storage::run_blocking;
use crate::validator;

/// Terminal state of one ingest request.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Staged for the first time. Dispatch happens later.
    Accepted { event_id: String, sequence_number: u64 },
    /// Same (workspace, idempotency key) already accepted within the retention window.
    Duplicate { original_event_id: String },
    Invalid(ValidationError),
    Unavailable(StoreError),
}

/// Validate → deduplicate → stage → acknowledge.
///
/// Dispatch is never awaited here; a successful append only nudges the
/// dispatcher. If staging fails the idempotency reservation is released so a
/// retry of the same key is not blocked for the whole retention window.
/// Reserve and append run as one detached task, so a caller that goes away
/// mid-request cannot leave a reservation without a staged record.
#[derive(Clone)]
pub struct IngestUseCase {
    idempotency: Arc<dyn IdempotencyStore>,
    staging: Arc<dyn StagingLog>,
    append_timeout: Duration,
    dispatch_wake: Option<Arc<Notify>>,
}

impl IngestUseCase {
    pub fn new(
        idempotency: Arc<dyn IdempotencyStore>,
        staging: Arc<dyn StagingLog>,
        append_timeout: Duration,
    ) -> Self {
        Self {
            idempotency,
            staging,
            append_timeout,
            dispatch_wake: None,
        }
    }

    pub fn with_dispatch_wake(mut self, wake: Arc<Notify>) -> Self {
        self.dispatch_wake = Some(wake);
        self
    }

    pub fn staging(&self) -> &Arc<dyn StagingLog> {
        &self.staging
    }

    pub fn idempotency(&self) -> &Arc<dyn IdempotencyStore> {
        &self.idempotency
    }

    pub async fn ingest(&self, raw: &[u8]) -> IngestOutcome {
        let span = tracing::info_span!(
            "ingest",
            request_id = %Uuid::new_v4(),
            event_id = Empty,
            event_type = Empty,
            workspace = Empty,
            correlation_id = Empty,
        );
        async {
            debug!(bytes = raw.len(), "envelope received");
            let envelope = match validator::validate(raw) {
                Ok(env) => env,
                Err(e) => {
                    gateway_metrics::request_invalid();
                    info!("envelope rejected: {}", e);
                    return IngestOutcome::Invalid(e);
                }
            };
            let current = tracing::Span::current();
            current.record("event_id", envelope.event_id.as_str());
            current.record("event_type", envelope.event_type.as_str());
            current.record("workspace", envelope.workspace_slug.as_str());
            current.record("correlation_id", envelope.correlation_id());

            let this = self.clone();
            let staged = tokio::spawn(
                async move { this.ingest_validated(envelope).await }.in_current_span(),
            );
            match staged.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    gateway_metrics::request_unavailable();
                    warn!("ingest task failed: {}", e);
                    IngestOutcome::Unavailable(StoreError::StorageUnavailable(format!(
                        "ingest task failed: {e}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest_validated(&self, envelope: Envelope) -> IngestOutcome {
        debug!("envelope validated");
        let scope = IdempotencyScope::new(&envelope.workspace_slug, envelope.idempotency_key());

        let store = self.idempotency.clone();
        let (reserve_scope, event_id) = (scope.clone(), envelope.event_id.clone());
        let reservation = run_blocking(move || {
            store.reserve_at(&reserve_scope, &event_id, chrono::Utc::now())
        })
        .await;

        match reservation {
            Ok(Reservation::Fresh) => {}
            Ok(Reservation::Duplicate { original_event_id }) => {
                gateway_metrics::request_duplicate();
                info!(original_event_id = %original_event_id, "duplicate envelope, already accepted");
                return IngestOutcome::Duplicate { original_event_id };
            }
            Err(e) => {
                gateway_metrics::request_unavailable();
                warn!("idempotency check failed: {}", e);
                return IngestOutcome::Unavailable(e);
            }
        }
        debug!("idempotency key reserved");

        match self.append(&envelope, &scope).await {
            Ok(sequence_number) => {
                if let Some(wake) = &self.dispatch_wake {
                    wake.notify_waiters();
                }
                gateway_metrics::request_accepted();
                info!(sequence_number, "envelope staged and acknowledged");
                IngestOutcome::Accepted {
                    event_id: envelope.event_id,
                    sequence_number,
                }
            }
            Err(e) => {
                gateway_metrics::request_unavailable();
                warn!("envelope not staged: {}", e);
                IngestOutcome::Unavailable(e)
            }
        }
    }

    /// Durable append bounded by `append_timeout`. The append itself runs on
    /// the blocking pool and is never cancelled: once it commits the record
    /// stays staged even if the caller has gone away.
    async fn append(&self, envelope: &Envelope, scope: &IdempotencyScope) -> Result<u64, StoreError> {
        let staging = self.staging.clone();
        let env = envelope.clone();
        let mut task = tokio::task::spawn_blocking(move || staging.append(&env));

        let result = match tokio::time::timeout(self.append_timeout, &mut task).await {
            Ok(joined) => joined
                .map_err(|e| StoreError::StorageUnavailable(format!("append task failed: {e}")))
                .and_then(|r| r),
            Err(_) => {
                // the write may still land; keep the reservation unless it fails
                let store = self.idempotency.clone();
                let scope = scope.clone();
                let event_id = envelope.event_id.clone();
                tokio::spawn(async move {
                    if !matches!(task.await, Ok(Ok(_))) {
                        release(store, scope, event_id).await;
                    }
                });
                return Err(StoreError::StorageUnavailable(format!(
                    "staging append timed out after {}ms",
                    self.append_timeout.as_millis()
                )));
            }
        };

        if result.is_err() {
            release(self.idempotency.clone(), scope.clone(), envelope.event_id.clone()).await;
        }
        result
    }
}

async fn release(store: Arc<dyn IdempotencyStore>, scope: IdempotencyScope, event_id: String) {
    match run_blocking(move || store.release(&scope, &event_id)).await {
        Ok(true) => debug!("idempotency reservation released"),
        Ok(false) => {}
        Err(e) => warn!("failed to release idempotency reservation: {}", e),
    }
}
