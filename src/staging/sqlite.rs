use super::{DrainRequest, StagingLog, StagingStats};
use crate::envelope::{DispatchState, Envelope, RetryState, StagedRecord};
use crate::error::{Result, StoreError};
use crate::metrics::staging as staging_metrics;
use crate::storage::{from_millis, millis, open_database, open_in_memory};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{error, warn};

// AUTOINCREMENT keeps sequence numbers from being reused once compaction
// deletes the highest dispatched rows.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS staged_records (
    sequence_number  INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id         TEXT NOT NULL,
    event_type       TEXT NOT NULL,
    workspace_slug   TEXT NOT NULL,
    envelope_json    TEXT NOT NULL,
    received_at      INTEGER NOT NULL,
    dispatch_state   TEXT NOT NULL DEFAULT 'pending',
    attempts         INTEGER NOT NULL DEFAULT 0,
    next_attempt_at  INTEGER NOT NULL,
    last_delay_ms    INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT,
    dispatched_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_staged_state_seq ON staged_records (dispatch_state, sequence_number);
"#;

const RECORD_COLUMNS: &str = "sequence_number, received_at, dispatch_state, attempts, \
     next_attempt_at, last_delay_ms, last_error, envelope_json";

pub struct SqliteStagingLog {
    conn: Mutex<Connection>,
    pending: AtomicU64,
    high_water_mark: Option<u64>,
    read_only: AtomicBool,
}

struct RawRecord {
    sequence_number: u64,
    received_at: i64,
    dispatch_state: String,
    attempts: u32,
    next_attempt_at: i64,
    last_delay_ms: u64,
    last_error: Option<String>,
    envelope_json: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence_number: row.get::<_, i64>(0)? as u64,
            received_at: row.get(1)?,
            dispatch_state: row.get(2)?,
            attempts: row.get::<_, i64>(3)? as u32,
            next_attempt_at: row.get(4)?,
            last_delay_ms: row.get::<_, i64>(5)? as u64,
            last_error: row.get(6)?,
            envelope_json: row.get(7)?,
        })
    }

    fn decode(self) -> std::result::Result<StagedRecord, String> {
        let envelope: Envelope =
            serde_json::from_str(&self.envelope_json).map_err(|e| e.to_string())?;
        let dispatch_state = DispatchState::parse(&self.dispatch_state)
            .ok_or_else(|| format!("unknown dispatch_state '{}'", self.dispatch_state))?;
        Ok(StagedRecord {
            sequence_number: self.sequence_number,
            received_at: from_millis(self.received_at),
            dispatch_state,
            retry: RetryState {
                attempts: self.attempts,
                next_attempt_at: (self.attempts > 0).then(|| from_millis(self.next_attempt_at)),
                last_delay_ms: self.last_delay_ms,
                last_error: self.last_error,
            },
            envelope,
        })
    }
}

impl SqliteStagingLog {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P, high_water_mark: Option<u64>) -> Result<Self> {
        Self::open(data_root.as_ref().join("staging.db"), high_water_mark)
    }

    pub fn open<P: AsRef<Path>>(path: P, high_water_mark: Option<u64>) -> Result<Self> {
        Self::with_connection(open_database(path)?, high_water_mark)
    }

    pub fn open_in_memory(high_water_mark: Option<u64>) -> Result<Self> {
        Self::with_connection(open_in_memory()?, high_water_mark)
    }

    fn with_connection(conn: Connection, high_water_mark: Option<u64>) -> Result<Self> {
        // A corrupted file still opens, latched read-only, so recovery tooling
        // can read whatever is left.
        let mut read_only = false;
        match Self::check_integrity(&conn) {
            Ok(()) => {}
            Err(StoreError::Corrupted(reason)) => {
                error!(%reason, "staging log failed integrity check; refusing new appends");
                read_only = true;
            }
            Err(e) => return Err(e),
        }

        let pending = match Self::count_pending(&conn) {
            Ok(n) => n,
            Err(StoreError::Corrupted(reason)) => {
                warn!(%reason, "pending records could not be counted; starting from zero");
                read_only = true;
                0
            }
            Err(e) => return Err(e),
        };
        staging_metrics::pending(pending);

        Ok(Self {
            conn: Mutex::new(conn),
            pending: AtomicU64::new(pending),
            high_water_mark,
            read_only: AtomicBool::new(read_only),
        })
    }

    fn check_integrity(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        let integrity: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        if integrity != "ok" {
            return Err(StoreError::Corrupted(integrity));
        }
        Ok(())
    }

    fn count_pending(conn: &Connection) -> Result<u64> {
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM staged_records WHERE dispatch_state = 'pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(pending as u64)
    }

    pub fn high_water_mark(&self) -> Option<u64> {
        self.high_water_mark
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Corruption latches the log read-only; reads keep working for recovery.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(StoreError::Corrupted(reason)) = &result {
            if !self.read_only.swap(true, Ordering::SeqCst) {
                error!(%reason, "staging log storage corrupted; halting appends");
            }
        }
        result
    }

    fn append_inner(&self, envelope: &Envelope, received_at: DateTime<Utc>) -> Result<u64> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupted(
                "staging log is read-only after a corruption error".to_string(),
            ));
        }
        let envelope_json = serde_json::to_string(envelope)
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        let mut conn = self.conn();
        if let Some(limit) = self.high_water_mark {
            let pending = self.pending.load(Ordering::SeqCst);
            if pending >= limit {
                staging_metrics::overloaded();
                return Err(StoreError::Overloaded { pending, limit });
            }
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let received_ms = millis(received_at);
        tx.execute(
            "INSERT INTO staged_records
                (event_id, event_type, workspace_slug, envelope_json, received_at, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                envelope.event_id,
                envelope.event_type,
                envelope.workspace_slug,
                envelope_json,
                received_ms
            ],
        )?;
        let sequence_number = tx.last_insert_rowid() as u64;
        tx.commit()?;

        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        staging_metrics::append_success(envelope_json.len());
        staging_metrics::pending(pending);
        Ok(sequence_number)
    }

    fn drain_inner(&self, request: &DrainRequest) -> Result<Vec<StagedRecord>> {
        let eligible_ms = request.eligible_at.map(millis).unwrap_or(i64::MAX);
        let conn = self.conn();
        let raws: Vec<RawRecord> = {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM staged_records
                 WHERE dispatch_state = 'pending'
                   AND sequence_number > ?1
                   AND next_attempt_at <= ?2
                   AND (sequence_number % ?3) = ?4
                 ORDER BY sequence_number ASC
                 LIMIT ?5"
            ))?;
            let rows = stmt.query_map(
                params![
                    request.after as i64,
                    eligible_ms,
                    request.partition.count as i64,
                    request.partition.index as i64,
                    request.limit as i64
                ],
                RawRecord::from_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            let seq = raw.sequence_number;
            match raw.decode() {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(sequence_number = seq, %reason, "undecodable staged record marked failed");
                    let changed = conn.execute(
                        "UPDATE staged_records SET dispatch_state = 'failed', last_error = ?2
                         WHERE sequence_number = ?1 AND dispatch_state = 'pending'",
                        params![seq as i64, reason],
                    )?;
                    if changed > 0 {
                        let pending = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                        staging_metrics::pending(pending);
                    }
                }
            }
        }
        Ok(records)
    }

    fn mark_dispatched_inner(&self, sequence_number: u64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE staged_records SET dispatch_state = 'dispatched', dispatched_at = ?2
             WHERE sequence_number = ?1 AND dispatch_state = 'pending'",
            params![sequence_number as i64, millis(Utc::now())],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let pending = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        staging_metrics::pending(pending);
        Ok(true)
    }

    fn record_failure_inner(&self, sequence_number: u64, retry: &RetryState) -> Result<()> {
        let next = retry.next_attempt_at.map(millis).unwrap_or_else(|| millis(Utc::now()));
        self.conn().execute(
            "UPDATE staged_records
                SET attempts = ?2, next_attempt_at = ?3, last_delay_ms = ?4, last_error = ?5
              WHERE sequence_number = ?1 AND dispatch_state = 'pending'",
            params![
                sequence_number as i64,
                retry.attempts as i64,
                next,
                retry.last_delay_ms as i64,
                retry.last_error
            ],
        )?;
        Ok(())
    }

    fn get_inner(&self, sequence_number: u64) -> Result<Option<StagedRecord>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM staged_records WHERE sequence_number = ?1"),
                params![sequence_number as i64],
                RawRecord::from_row,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => raw.decode().map(Some).map_err(|reason| {
                StoreError::StorageUnavailable(format!(
                    "record {sequence_number} cannot be decoded: {reason}"
                ))
            }),
        }
    }

    fn stats_inner(&self) -> Result<StagingStats> {
        let conn = self.conn();
        let mut stats = StagingStats {
            high_water_mark: self.high_water_mark,
            read_only: self.read_only.load(Ordering::SeqCst),
            ..StagingStats::default()
        };
        {
            let mut stmt = conn.prepare_cached(
                "SELECT dispatch_state, COUNT(*) FROM staged_records GROUP BY dispatch_state",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (state, n) = row?;
                match DispatchState::parse(&state) {
                    Some(DispatchState::Pending) => stats.pending = n as u64,
                    Some(DispatchState::Dispatched) => stats.dispatched = n as u64,
                    Some(DispatchState::Failed) => stats.failed = n as u64,
                    None => warn!(state = %state, "unknown dispatch_state in staging log"),
                }
            }
        }
        stats.oldest_pending_sequence = conn
            .query_row(
                "SELECT MIN(sequence_number) FROM staged_records WHERE dispatch_state = 'pending'",
                [],
                |r| r.get::<_, Option<i64>>(0),
            )?
            .map(|v| v as u64);
        stats.last_sequence = conn
            .query_row("SELECT MAX(sequence_number) FROM staged_records", [], |r| {
                r.get::<_, Option<i64>>(0)
            })?
            .map(|v| v as u64);
        Ok(stats)
    }

    fn compact_inner(&self, dispatched_before: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM staged_records
              WHERE dispatch_state = 'dispatched' AND dispatched_at <= ?1",
            params![millis(dispatched_before)],
        )?;
        if removed > 0 {
            staging_metrics::compacted(removed);
        }
        Ok(removed)
    }
}

impl StagingLog for SqliteStagingLog {
    fn append_at(&self, envelope: &Envelope, received_at: DateTime<Utc>) -> Result<u64> {
        let result = self.append_inner(envelope, received_at);
        if let Err(e) = &result {
            if !matches!(e, StoreError::Overloaded { .. }) {
                staging_metrics::append_error();
            }
        }
        self.guard(result)
    }

    fn drain_pending(&self, request: &DrainRequest) -> Result<Vec<StagedRecord>> {
        self.guard(self.drain_inner(request))
    }

    fn mark_dispatched(&self, sequence_number: u64) -> Result<bool> {
        self.guard(self.mark_dispatched_inner(sequence_number))
    }

    fn record_failure(&self, sequence_number: u64, retry: &RetryState) -> Result<()> {
        self.guard(self.record_failure_inner(sequence_number, retry))
    }

    fn get(&self, sequence_number: u64) -> Result<Option<StagedRecord>> {
        self.guard(self.get_inner(sequence_number))
    }

    fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    fn stats(&self) -> Result<StagingStats> {
        self.guard(self.stats_inner())
    }

    fn compact(&self, dispatched_before: DateTime<Utc>) -> Result<usize> {
        self.guard(self.compact_inner(dispatched_before))
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{Partition, PendingScan};

    fn envelope(n: u32) -> Envelope {
        let mut env = Envelope::default();
        env.event_id = format!("evt-{n}");
        env.event_type = "deal.updated".into();
        env.workspace_slug = "acme".into();
        env.metadata.idempotency_key = format!("idem-{n}");
        env
    }

    #[test]
    fn append_assigns_increasing_sequence_numbers() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        let a = log.append(&envelope(1)).unwrap();
        let b = log.append(&envelope(2)).unwrap();
        assert!(b > a);
        assert_eq!(log.pending_count(), 2);

        let drained = log.drain_pending(&DrainRequest::all(10)).unwrap();
        let seqs: Vec<u64> = drained.iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![a, b]);
        assert_eq!(drained[0].envelope.event_id, "evt-1");
        assert_eq!(drained[0].dispatch_state, DispatchState::Pending);
    }

    #[test]
    fn mark_dispatched_is_idempotent() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        let seq = log.append(&envelope(1)).unwrap();
        assert!(log.mark_dispatched(seq).unwrap());
        assert!(!log.mark_dispatched(seq).unwrap());
        assert!(!log.mark_dispatched(9_999).unwrap());
        assert_eq!(log.pending_count(), 0);
        assert_eq!(
            log.get(seq).unwrap().unwrap().dispatch_state,
            DispatchState::Dispatched
        );
        assert!(log.drain_pending(&DrainRequest::all(10)).unwrap().is_empty());
    }

    #[test]
    fn high_water_mark_rejects_until_drained() {
        let log = SqliteStagingLog::open_in_memory(Some(2)).unwrap();
        let first = log.append(&envelope(1)).unwrap();
        log.append(&envelope(2)).unwrap();
        assert_eq!(
            log.append(&envelope(3)),
            Err(StoreError::Overloaded {
                pending: 2,
                limit: 2
            })
        );
        log.mark_dispatched(first).unwrap();
        assert!(log.append(&envelope(3)).is_ok());
    }

    #[test]
    fn backoff_hides_records_until_eligible() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        let seq = log.append(&envelope(1)).unwrap();
        let now = Utc::now();
        let retry = RetryState {
            attempts: 1,
            next_attempt_at: Some(now + chrono::Duration::seconds(30)),
            last_delay_ms: 30_000,
            last_error: Some("rejected".into()),
        };
        log.record_failure(seq, &retry).unwrap();

        let mut req = DrainRequest::all(10);
        req.eligible_at = Some(now);
        assert!(log.drain_pending(&req).unwrap().is_empty());
        req.eligible_at = Some(now + chrono::Duration::seconds(31));
        let drained = log.drain_pending(&req).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].retry.attempts, 1);
        assert_eq!(drained[0].retry.last_delay_ms, 30_000);
        assert_eq!(drained[0].retry.last_error.as_deref(), Some("rejected"));
    }

    #[test]
    fn partitions_split_pending_records() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        for n in 0..10 {
            log.append(&envelope(n)).unwrap();
        }
        let mut seen = Vec::new();
        for index in 0..3 {
            let mut req = DrainRequest::all(100);
            req.partition = Partition::new(index, 3);
            let part = log.drain_pending(&req).unwrap();
            assert!(part.iter().all(|r| req.partition.owns(r.sequence_number)));
            seen.extend(part.into_iter().map(|r| r.sequence_number));
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn pending_scan_pages_lazily_and_resumes() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        for n in 0..7 {
            log.append(&envelope(n)).unwrap();
        }
        let mut scan = PendingScan::new(&log, Partition::ALL, 3);
        let first: Vec<u64> = scan
            .by_ref()
            .take(4)
            .map(|r| r.unwrap().sequence_number)
            .collect();
        assert_eq!(first.len(), 4);

        let rest: Vec<u64> = PendingScan::resume(&log, Partition::ALL, 3, scan.cursor())
            .map(|r| r.unwrap().sequence_number)
            .collect();
        assert_eq!(rest.len(), 3);
        assert!(rest[0] > first[3]);
    }

    #[test]
    fn undecodable_rows_are_marked_failed() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        let bad = log.append(&envelope(1)).unwrap();
        let good = log.append(&envelope(2)).unwrap();
        log.conn()
            .execute(
                "UPDATE staged_records SET envelope_json = '{broken' WHERE sequence_number = ?1",
                params![bad as i64],
            )
            .unwrap();

        let drained = log.drain_pending(&DrainRequest::all(10)).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sequence_number, good);
        let stats = log.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(log.pending_count(), 1);
    }

    #[test]
    fn compaction_removes_only_dispatched_and_keeps_sequence_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let last;
        {
            let log = SqliteStagingLog::open_at_root(dir.path(), None).unwrap();
            let a = log.append(&envelope(1)).unwrap();
            last = log.append(&envelope(2)).unwrap();
            log.mark_dispatched(last).unwrap();
            let removed = log
                .compact(Utc::now() + chrono::Duration::seconds(1))
                .unwrap();
            assert_eq!(removed, 1);
            assert!(log.get(a).unwrap().is_some());
            assert!(log.get(last).unwrap().is_none());
        }
        let log = SqliteStagingLog::open_at_root(dir.path(), None).unwrap();
        assert_eq!(log.pending_count(), 1);
        assert!(log.append(&envelope(3)).unwrap() > last);
    }

    #[test]
    fn stats_report_counts_and_bounds() {
        let log = SqliteStagingLog::open_in_memory(Some(50)).unwrap();
        let a = log.append(&envelope(1)).unwrap();
        let b = log.append(&envelope(2)).unwrap();
        log.mark_dispatched(a).unwrap();
        let stats = log.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.oldest_pending_sequence, Some(b));
        assert_eq!(stats.last_sequence, Some(b));
        assert_eq!(stats.high_water_mark, Some(50));
        assert!(!stats.read_only);
    }

    #[test]
    fn corruption_latches_read_only() {
        let log = SqliteStagingLog::open_in_memory(None).unwrap();
        let seq = log.append(&envelope(1)).unwrap();
        let _ = log.guard::<()>(Err(StoreError::Corrupted("disk image is malformed".into())));
        assert!(log.is_read_only());
        assert!(matches!(
            log.append(&envelope(2)),
            Err(StoreError::Corrupted(_))
        ));
        // reads still work for recovery
        assert_eq!(log.drain_pending(&DrainRequest::all(10)).unwrap().len(), 1);
        assert!(log.get(seq).unwrap().is_some());
    }

    #[test]
    fn corrupted_file_opens_read_only() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.db");
        let (first, page_size) = {
            let log = SqliteStagingLog::open(&path, None).unwrap();
            let first = log.append(&envelope(0)).unwrap();
            for n in 1..400 {
                log.append(&envelope(n)).unwrap();
            }
            let page_size: i64 = log
                .conn()
                .query_row("PRAGMA page_size", [], |r| r.get(0))
                .unwrap();
            (first, page_size as u64)
        };

        // page 4 holds the state index; the table itself stays readable
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(3 * page_size)).unwrap();
        file.write_all(&vec![0xFF; page_size as usize]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let log = SqliteStagingLog::open(&path, None).unwrap();
        assert!(log.is_read_only());
        assert!(matches!(
            log.append(&envelope(500)),
            Err(StoreError::Corrupted(_))
        ));
        assert_eq!(
            log.get(first).unwrap().map(|r| r.envelope.event_id),
            Some("evt-0".to_string())
        );
    }
}
