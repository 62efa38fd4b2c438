//! Background dispatch of staged records to the downstream queue.
//!
//! Each worker owns one partition of the sequence space (`seq % workers`), so
//! no two workers ever offer the same record concurrently. Failed attempts
//! leave the record `Pending` with its retry state persisted next to it; the
//! drain query skips it until `next_attempt_at` has passed.

pub mod backoff;

pub use backoff::Backoff;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::app::ports::{DownstreamQueue, EnqueueOutcome};
use crate::config::DispatcherConfig;
use crate::envelope::{RetryState, StagedRecord};
use crate::error::{QueueError, Result};
use crate::metrics::dispatcher as dispatch_metrics;
use crate::staging::{DrainRequest, Partition, StagingLog};
use crate::storage::run_blocking;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub workers: u32,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub enqueue_timeout: Duration,
    pub backoff: Backoff,
}

impl From<&DispatcherConfig> for DispatcherSettings {
    fn from(cfg: &DispatcherConfig) -> Self {
        Self {
            workers: cfg.workers.max(1),
            batch_size: cfg.batch_size.max(1),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            enqueue_timeout: Duration::from_millis(cfg.enqueue_timeout_ms),
            backoff: Backoff::from(&cfg.backoff),
        }
    }
}

/// Result of offering one record downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Dispatched,
    /// Still pending; eligible again after `delay`.
    Retrying { attempts: u32, delay: Duration },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub dispatched: usize,
    pub retrying: usize,
}

pub struct Dispatcher {
    log: Arc<dyn StagingLog>,
    queue: Arc<dyn DownstreamQueue>,
    settings: DispatcherSettings,
    wake: Arc<Notify>,
}

pub struct DispatcherHandle {
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Wait for every worker to finish its current attempt and exit.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("dispatcher worker panicked: {}", e);
            }
        }
    }
}

impl Dispatcher {
    pub fn new(
        log: Arc<dyn StagingLog>,
        queue: Arc<dyn DownstreamQueue>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            log,
            queue,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle the ingest path uses to nudge idle workers after an append.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Start the worker pool. Records left `Pending` by a previous run are
    /// picked up by the first pass of each worker.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> DispatcherHandle {
        let workers = self.settings.workers;
        info!(
            workers,
            queue = self.queue.name(),
            pending = self.log.pending_count(),
            "dispatcher starting; re-offering pending records"
        );
        let workers = (0..workers)
            .map(|index| {
                let partition = Partition::new(index, workers);
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    this.run_worker(partition, shutdown)
                        .instrument(tracing::info_span!("dispatch_worker", worker = index)),
                )
            })
            .collect();
        DispatcherHandle { workers }
    }

    async fn run_worker(self: Arc<Self>, partition: Partition, mut shutdown: watch::Receiver<bool>) {
        debug!(index = partition.index, count = partition.count, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.dispatch_once(partition).await {
                // a full page means more work may be waiting right now
                Ok(summary) if summary.attempted == self.settings.batch_size => continue,
                Ok(_) => {}
                Err(e) => warn!("dispatch pass failed: {}", e),
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(index = partition.index, "worker stopped");
    }

    /// Offer one page of eligible pending records from `partition`, in sequence order.
    pub async fn dispatch_once(&self, partition: Partition) -> Result<PassSummary> {
        let request = DrainRequest {
            after: 0,
            limit: self.settings.batch_size,
            partition,
            eligible_at: Some(Utc::now()),
        };
        let log = self.log.clone();
        let records = run_blocking(move || log.drain_pending(&request)).await?;

        let mut summary = PassSummary::default();
        for record in records {
            summary.attempted += 1;
            match self.attempt(record).await? {
                AttemptResult::Dispatched => summary.dispatched += 1,
                AttemptResult::Retrying { .. } => summary.retrying += 1,
            }
        }
        Ok(summary)
    }

    /// Offer a single record and persist the outcome.
    pub async fn attempt(&self, record: StagedRecord) -> Result<AttemptResult> {
        let seq = record.sequence_number;
        dispatch_metrics::attempt();
        let started = Instant::now();
        let timeout_ms = self.settings.enqueue_timeout.as_millis() as u64;

        let outcome = tokio::time::timeout(self.settings.enqueue_timeout, self.queue.enqueue(&record.envelope))
            .await
            .unwrap_or(Err(QueueError::Timeout(timeout_ms)));

        let failure = match outcome {
            Ok(EnqueueOutcome::Ack) => {
                let log = self.log.clone();
                let changed = run_blocking(move || log.mark_dispatched(seq)).await?;
                dispatch_metrics::acked(started.elapsed().as_secs_f64());
                debug!(
                    sequence_number = seq,
                    event_id = %record.envelope.event_id,
                    attempts = record.retry.attempts + 1,
                    already = !changed,
                    "record dispatched"
                );
                return Ok(AttemptResult::Dispatched);
            }
            Ok(EnqueueOutcome::Reject(reason)) => {
                dispatch_metrics::rejected();
                format!("rejected: {reason}")
            }
            Err(e) => {
                dispatch_metrics::transport_failure();
                e.to_string()
            }
        };

        let attempts = record.retry.attempts.saturating_add(1);
        let delay = {
            let mut rng = rand::thread_rng();
            self.settings.backoff.next_delay(
                attempts,
                Duration::from_millis(record.retry.last_delay_ms),
                &mut rng,
            )
        };
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let retry = RetryState {
            attempts,
            next_attempt_at: Some(next_attempt_at),
            last_delay_ms: delay.as_millis() as u64,
            last_error: Some(failure.clone()),
        };
        dispatch_metrics::backoff_delay(delay.as_secs_f64());
        warn!(
            sequence_number = seq,
            event_id = %record.envelope.event_id,
            attempts,
            delay_ms = retry.last_delay_ms,
            "dispatch failed, will retry: {}",
            failure
        );

        let log = self.log.clone();
        run_blocking(move || log.record_failure(seq, &retry)).await?;
        Ok(AttemptResult::Retrying { attempts, delay })
    }
}
