//! Idempotency index: `(workspaceSlug, idempotencyKey) -> (eventId, firstSeenAt)`.
//!
//! The only concurrency-critical contract in the gateway lives here: for a
//! given scope, concurrent `check_and_reserve` calls produce exactly one
//! `Fresh` and any number of `Duplicate` answers. Both backends implement the
//! check and the insert as a single atomic step.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

use crate::error::Result;
use crate::storage::run_blocking;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Fresh,
    Duplicate { original_event_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyEntry {
    pub event_id: String,
    pub first_seen_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.first_seen_at + retention <= now
    }
}

/// Tenant-qualified idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyScope {
    pub workspace_slug: String,
    pub idempotency_key: String,
}

impl IdempotencyScope {
    pub fn new(workspace_slug: &str, idempotency_key: &str) -> Self {
        Self {
            workspace_slug: workspace_slug.to_string(),
            idempotency_key: idempotency_key.to_string(),
        }
    }

    /// Stable hex digest used as the storage key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.workspace_slug.as_bytes());
        // unit separator keeps ("a", "bc") and ("ab", "c") apart
        hasher.update([0x1f]);
        hasher.update(self.idempotency_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub trait IdempotencyStore: Send + Sync {
    /// Atomic check-then-insert evaluated at `now`. An expired entry counts as absent.
    fn reserve_at(
        &self,
        scope: &IdempotencyScope,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Drop the reservation only if it is still held by `event_id`.
    fn release(&self, scope: &IdempotencyScope, event_id: &str) -> Result<bool>;

    /// Evict entries older than the retention window.
    fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    fn backend_name(&self) -> &'static str;

    fn check_and_reserve(
        &self,
        workspace_slug: &str,
        idempotency_key: &str,
        event_id: &str,
    ) -> Result<Reservation> {
        self.reserve_at(
            &IdempotencyScope::new(workspace_slug, idempotency_key),
            event_id,
            Utc::now(),
        )
    }

    fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }
}

pub(crate) fn retention_from(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Background eviction loop. Runs until `shutdown` flips to `true`.
pub fn spawn_sweeper(
    store: Arc<dyn IdempotencyStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            backend = store.backend_name(),
            interval_secs = interval.as_secs(),
            "idempotency sweeper started"
        );
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
            let st = store.clone();
            match run_blocking(move || st.sweep_expired()).await {
                Ok(0) => {}
                Ok(n) => debug!(evicted = n, "idempotency sweep"),
                Err(e) => warn!("idempotency sweep failed: {}", e),
            }
        }
        info!("idempotency sweeper stopped");
    })
}
