//! Durable staging between acceptance and downstream dispatch.
//!
//! Records are keyed by a process-monotonic `sequence_number`. A record is
//! `Pending` until the dispatcher marks it `Dispatched`; only then may
//! compaction remove it. Everything not yet dispatched is re-offered after a
//! restart, so downstream delivery is at-least-once.

pub mod sqlite;

pub use sqlite::SqliteStagingLog;

use crate::envelope::{Envelope, RetryState, StagedRecord};
use crate::error::Result;
use crate::storage::run_blocking;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Disjoint slice of the sequence space owned by one dispatcher worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    pub const ALL: Partition = Partition { index: 0, count: 1 };

    pub fn new(index: u32, count: u32) -> Self {
        let count = count.max(1);
        Self {
            index: index % count,
            count,
        }
    }

    pub fn owns(&self, sequence_number: u64) -> bool {
        sequence_number % self.count as u64 == self.index as u64
    }
}

#[derive(Debug, Clone)]
pub struct DrainRequest {
    /// Exclusive lower bound on `sequence_number`.
    pub after: u64,
    pub limit: usize,
    pub partition: Partition,
    /// Only records whose retry backoff has elapsed by this instant.
    /// `None` returns every pending record regardless of backoff.
    pub eligible_at: Option<DateTime<Utc>>,
}

impl DrainRequest {
    pub fn all(limit: usize) -> Self {
        Self {
            after: 0,
            limit,
            partition: Partition::ALL,
            eligible_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StagingStats {
    pub pending: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub oldest_pending_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub high_water_mark: Option<u64>,
    pub read_only: bool,
}

pub trait StagingLog: Send + Sync {
    /// Durably append; the returned sequence number is only handed out after commit.
    fn append_at(&self, envelope: &Envelope, received_at: DateTime<Utc>) -> Result<u64>;

    /// Pending records ordered by `sequence_number` ascending.
    fn drain_pending(&self, request: &DrainRequest) -> Result<Vec<StagedRecord>>;

    /// Idempotent: returns `false` when the record was not pending.
    fn mark_dispatched(&self, sequence_number: u64) -> Result<bool>;

    /// Persist the retry schedule of a record that stays pending.
    fn record_failure(&self, sequence_number: u64, retry: &RetryState) -> Result<()>;

    fn get(&self, sequence_number: u64) -> Result<Option<StagedRecord>>;

    fn pending_count(&self) -> u64;

    fn stats(&self) -> Result<StagingStats>;

    /// Remove dispatched records whose dispatch happened at or before `dispatched_before`.
    fn compact(&self, dispatched_before: DateTime<Utc>) -> Result<usize>;

    fn is_read_only(&self) -> bool;

    fn append(&self, envelope: &Envelope) -> Result<u64> {
        self.append_at(envelope, Utc::now())
    }
}

/// Lazy, restartable walk over pending records, fetched a page at a time.
///
/// `cursor()` is the last sequence number yielded; passing it to
/// `PendingScan::resume` continues where a previous scan stopped.
pub struct PendingScan<'a> {
    log: &'a dyn StagingLog,
    partition: Partition,
    page_size: usize,
    eligible_at: Option<DateTime<Utc>>,
    cursor: u64,
    buffer: VecDeque<StagedRecord>,
    exhausted: bool,
}

impl<'a> PendingScan<'a> {
    pub fn new(log: &'a dyn StagingLog, partition: Partition, page_size: usize) -> Self {
        Self::resume(log, partition, page_size, 0)
    }

    pub fn resume(
        log: &'a dyn StagingLog,
        partition: Partition,
        page_size: usize,
        cursor: u64,
    ) -> Self {
        Self {
            log,
            partition,
            page_size: page_size.max(1),
            eligible_at: None,
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.eligible_at = Some(at);
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn fill(&mut self) -> Result<()> {
        let after = self
            .buffer
            .back()
            .map(|r| r.sequence_number)
            .unwrap_or(self.cursor);
        let page = self.log.drain_pending(&DrainRequest {
            after,
            limit: self.page_size,
            partition: self.partition,
            eligible_at: self.eligible_at,
        })?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for PendingScan<'_> {
    type Item = Result<StagedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let record = self.buffer.pop_front()?;
        self.cursor = record.sequence_number;
        Some(Ok(record))
    }
}

/// Periodically delete dispatched records older than `retention`.
pub fn spawn_janitor(
    log: Arc<dyn StagingLog>,
    interval: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = retention.as_secs(),
            "staging compaction janitor started"
        );
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let cutoff = Utc::now() - retention;
            let log = log.clone();
            match run_blocking(move || log.compact(cutoff)).await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "staging compaction"),
                Err(e) => warn!("staging compaction failed: {}", e),
            }
        }
        info!("staging compaction janitor stopped");
    })
}
