use chrono::{NaiveDate, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::db::{DocumentStore, StoreError};
use crate::models::quota::{
    CounterUsage, QuotaCounter, QuotaLimits, QuotaReport, QuotaSnapshot, StorageUsage,
};

struct QuotaState {
    snapshot: QuotaSnapshot,
    dirty: bool,
}

/// Tracks daily read/write/delete counters and cumulative storage bytes for
/// the durable store.
///
/// All updates go through one mutex so concurrent requests never lose an
/// increment; the lock is never held across an `.await`.
pub struct QuotaMonitor {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
}

impl QuotaMonitor {
    pub fn new(limits: QuotaLimits) -> Self {
        Self::with_snapshot(limits, QuotaSnapshot::empty(today()))
    }

    /// Resume from a persisted snapshot. A snapshot from an earlier day only
    /// contributes its storage bytes.
    pub fn with_snapshot(limits: QuotaLimits, snapshot: QuotaSnapshot) -> Self {
        let monitor = Self {
            limits,
            state: Mutex::new(QuotaState {
                snapshot,
                dirty: false,
            }),
        };
        monitor.rollover(today());
        monitor
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// UTC day the daily counters belong to.
    pub fn day(&self) -> NaiveDate {
        self.lock_current().snapshot.day
    }

    pub fn usage(&self) -> QuotaSnapshot {
        self.lock_current().snapshot.clone()
    }

    /// Usage as a fraction of the configured ceiling (1.0 = at the limit).
    pub fn percentage_of(&self, counter: QuotaCounter) -> f64 {
        let current = self.lock_current().snapshot.get(counter);
        fraction(current, self.limits.get(counter))
    }

    pub fn record_read(&self, documents: u64) {
        self.update(|s| s.reads = s.reads.saturating_add(documents));
    }

    /// One write; `size_delta` is the change in stored bytes it caused.
    pub fn record_write(&self, size_delta: i64) {
        self.update(|s| {
            s.writes = s.writes.saturating_add(1);
            s.storage_bytes = apply_delta(s.storage_bytes, size_delta);
        });
    }

    /// One delete that released `bytes` of storage.
    pub fn record_delete(&self, bytes: u64) {
        self.update(|s| {
            s.deletes = s.deletes.saturating_add(1);
            s.storage_bytes = s.storage_bytes.saturating_sub(bytes);
        });
    }

    /// Overwrite a counter. Used by operators and test harnesses to simulate
    /// usage levels.
    pub fn set_usage(&self, counter: QuotaCounter, value: u64) {
        self.update(|s| s.set(counter, value));
    }

    /// Start a new day if `today` is past the tracked one. Returns whether a
    /// reset happened.
    pub fn rollover(&self, today: NaiveDate) -> bool {
        let mut state = self.lock();
        Self::rollover_locked(&mut state, today)
    }

    pub fn report(&self) -> QuotaReport {
        let snapshot = self.usage();
        let counter = |c: QuotaCounter| CounterUsage {
            current: snapshot.get(c),
            limit: self.limits.get(c),
            percentage: as_percent(fraction(snapshot.get(c), self.limits.get(c))),
        };

        QuotaReport {
            reads: counter(QuotaCounter::Reads),
            writes: counter(QuotaCounter::Writes),
            deletes: counter(QuotaCounter::Deletes),
            storage: StorageUsage {
                current_bytes: snapshot.storage_bytes,
                limit_bytes: self.limits.storage_bytes,
                percentage: as_percent(fraction(
                    snapshot.storage_bytes,
                    self.limits.storage_bytes,
                )),
            },
        }
    }

    /// Load the last persisted snapshot from the durable store.
    pub async fn restore(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        let Some(saved) = store.load_quota().await? else {
            debug!("No persisted quota snapshot found");
            return Ok(());
        };

        let mut state = self.lock();
        state.snapshot = saved;
        state.dirty = false;
        Self::rollover_locked(&mut state, today());
        info!(
            day = %state.snapshot.day,
            reads = state.snapshot.reads,
            writes = state.snapshot.writes,
            deletes = state.snapshot.deletes,
            storage_bytes = state.snapshot.storage_bytes,
            "Restored quota usage"
        );
        Ok(())
    }

    /// Persist the current snapshot if it changed since the last flush.
    /// Quota bookkeeping writes are not counted against the quota.
    pub async fn flush(&self, store: &dyn DocumentStore) -> Result<bool, StoreError> {
        let snapshot = {
            let mut state = self.lock_current();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            state.snapshot.clone()
        };

        if let Err(e) = store.save_quota(&snapshot).await {
            self.lock().dirty = true;
            return Err(e);
        }
        debug!(day = %snapshot.day, "Flushed quota usage");
        Ok(true)
    }

    fn update(&self, f: impl FnOnce(&mut QuotaSnapshot)) {
        let mut state = self.lock_current();
        f(&mut state.snapshot);
        state.dirty = true;
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_current(&self) -> MutexGuard<'_, QuotaState> {
        let mut state = self.lock();
        Self::rollover_locked(&mut state, today());
        state
    }

    fn rollover_locked(state: &mut QuotaState, today: NaiveDate) -> bool {
        if today <= state.snapshot.day {
            return false;
        }
        info!(
            previous_day = %state.snapshot.day,
            day = %today,
            "Daily quota counters reset"
        );
        state.snapshot = state.snapshot.carried_into(today);
        state.dirty = true;
        true
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn fraction(current: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 1.0;
    }
    current as f64 / limit as f64
}

fn as_percent(fraction: f64) -> f64 {
    (fraction * 10_000.0).round() / 100.0
}

fn apply_delta(bytes: u64, delta: i64) -> u64 {
    if delta >= 0 {
        bytes.saturating_add(delta.unsigned_abs())
    } else {
        bytes.saturating_sub(delta.unsigned_abs())
    }
}
