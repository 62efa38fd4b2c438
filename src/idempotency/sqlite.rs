use super::{retention_from, IdempotencyScope, IdempotencyStore, Reservation};
use crate::error::Result;
use crate::storage::{millis, open_database, open_in_memory};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    scope_hash       TEXT PRIMARY KEY,
    workspace_slug   TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL,
    event_id         TEXT NOT NULL,
    first_seen_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_first_seen ON idempotency_keys (first_seen_at);
"#;

/// Durable backend. Reservations survive restarts, and several gateway
/// processes pointed at the same file still see one `Fresh` per key because
/// each reservation runs in an IMMEDIATE transaction.
pub struct SqliteIdempotencyStore {
    conn: Mutex<Connection>,
    retention: chrono::Duration,
}

impl SqliteIdempotencyStore {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P, retention: Duration) -> Result<Self> {
        Self::open(data_root.as_ref().join("idempotency.db"), retention)
    }

    pub fn open<P: AsRef<Path>>(path: P, retention: Duration) -> Result<Self> {
        Self::with_connection(open_database(path)?, retention)
    }

    pub fn open_in_memory(retention: Duration) -> Result<Self> {
        Self::with_connection(open_in_memory()?, retention)
    }

    fn with_connection(conn: Connection, retention: Duration) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention: retention_from(retention),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    fn reserve_at(
        &self,
        scope: &IdempotencyScope,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let hash = scope.digest();
        let cutoff = millis(now - self.retention);
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT event_id, first_seen_at FROM idempotency_keys WHERE scope_hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((original_event_id, first_seen_at)) = existing {
            if first_seen_at > cutoff {
                return Ok(Reservation::Duplicate { original_event_id });
            }
            // expired entry: drop it and reserve afresh
            tx.execute(
                "DELETE FROM idempotency_keys WHERE scope_hash = ?1",
                params![hash],
            )?;
        }

        tx.execute(
            "INSERT INTO idempotency_keys (scope_hash, workspace_slug, idempotency_key, event_id, first_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                hash,
                scope.workspace_slug,
                scope.idempotency_key,
                event_id,
                millis(now)
            ],
        )?;
        tx.commit()?;
        Ok(Reservation::Fresh)
    }

    fn release(&self, scope: &IdempotencyScope, event_id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM idempotency_keys WHERE scope_hash = ?1 AND event_id = ?2",
            params![scope.digest(), event_id],
        )?;
        Ok(removed > 0)
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = millis(now - self.retention);
        let removed = self.conn().execute(
            "DELETE FROM idempotency_keys WHERE first_seen_at <= ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM idempotency_keys", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
