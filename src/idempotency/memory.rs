use super::{retention_from, IdempotencyEntry, IdempotencyScope, IdempotencyStore, Reservation};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Single-instance backend. Reservations do not survive a restart.
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, IdempotencyEntry>>,
    retention: chrono::Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: retention_from(retention),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, IdempotencyEntry>> {
        // Every mutation is a single map operation, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn reserve_at(
        &self,
        scope: &IdempotencyScope,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let key = scope.digest();
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            if !existing.is_expired(now, self.retention) {
                return Ok(Reservation::Duplicate {
                    original_event_id: existing.event_id.clone(),
                });
            }
        }
        entries.insert(
            key,
            IdempotencyEntry {
                event_id: event_id.to_string(),
                first_seen_at: now,
            },
        );
        Ok(Reservation::Fresh)
    }

    fn release(&self, scope: &IdempotencyScope, event_id: &str) -> Result<bool> {
        let key = scope.digest();
        let mut entries = self.entries();
        match entries.get(&key) {
            Some(entry) if entry.event_id == event_id => {
                entries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.retention));
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries().len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
