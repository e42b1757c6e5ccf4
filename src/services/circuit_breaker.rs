use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum::Display;
use tracing::{debug, info, warn};

use crate::db::StoreError;
use crate::models::quota::{BreakerReport, QuotaCounter};
use crate::services::quota::QuotaMonitor;

/// Default high-water mark at which the breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

/// A durable-store call refused because the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} blocked: durable store circuit open on {reason} quota")]
pub struct QuotaExceeded {
    pub operation: QuotaCounter,
    pub reason: QuotaCounter,
}

#[derive(Debug, Clone)]
struct Trip {
    reason: QuotaCounter,
    day: NaiveDate,
    opened_at: DateTime<Utc>,
}

/// Gates every durable-store call on quota usage.
///
/// A trip on a daily counter lasts until the quota day rolls over. A trip on
/// storage survives the rollover and is only cleared by
/// [`CircuitBreaker::close_if_storage_recovered`], which the cleanup sweeper
/// calls after reclaiming space.
pub struct CircuitBreaker {
    quota: Arc<QuotaMonitor>,
    threshold: f64,
    trip: Mutex<Option<Trip>>,
}

impl CircuitBreaker {
    pub fn new(quota: Arc<QuotaMonitor>, threshold: f64) -> Self {
        Self {
            quota,
            threshold,
            trip: Mutex::new(None),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn quota(&self) -> &Arc<QuotaMonitor> {
        &self.quota
    }

    /// Admit or refuse one durable operation of kind `operation`.
    pub fn check(&self, operation: QuotaCounter) -> Result<(), QuotaExceeded> {
        let mut trip = self.lock();
        self.close_after_daily_reset(&mut trip);

        if let Some(open) = trip.as_ref() {
            metrics::counter!("circuit_breaker_blocked_total").increment(1);
            debug!(operation = %operation, reason = %open.reason, "Durable store call blocked");
            return Err(QuotaExceeded {
                operation,
                reason: open.reason,
            });
        }

        for counter in relevant_counters(operation) {
            let usage = self.quota.percentage_of(*counter);
            if usage >= self.threshold {
                warn!(
                    operation = %operation,
                    reason = %counter,
                    usage = usage,
                    threshold = self.threshold,
                    "Quota high-water mark reached, opening durable store circuit"
                );
                *trip = Some(Trip {
                    reason: *counter,
                    day: self.quota.day(),
                    opened_at: Utc::now(),
                });
                metrics::counter!("circuit_breaker_blocked_total").increment(1);
                return Err(QuotaExceeded {
                    operation,
                    reason: *counter,
                });
            }
        }

        Ok(())
    }

    /// Run `call` against the durable store if the gate admits it.
    ///
    /// Returns `None` when the breaker refused the call or the store errored;
    /// callers treat both as "use the transient backend".
    pub async fn call<T, F, Fut>(&self, operation: QuotaCounter, call: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if self.check(operation).is_err() {
            return None;
        }
        match call().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    operation = %operation,
                    error = %e,
                    "Durable store call failed, falling back to transient storage"
                );
                None
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut trip = self.lock();
        self.close_after_daily_reset(&mut trip);
        if trip.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    /// The quota dimension that tripped the breaker, while open.
    pub fn blocked_operation(&self) -> Option<QuotaCounter> {
        let mut trip = self.lock();
        self.close_after_daily_reset(&mut trip);
        trip.as_ref().map(|t| t.reason)
    }

    pub fn report(&self) -> BreakerReport {
        let blocked_operation = self.blocked_operation();
        let status = match blocked_operation {
            Some(_) => BreakerState::Open,
            None => BreakerState::Closed,
        };
        BreakerReport {
            status: status.to_string(),
            blocked_operation,
        }
    }

    /// Close a storage trip once usage is back under the threshold.
    pub fn close_if_storage_recovered(&self) -> bool {
        let mut trip = self.lock();
        let Some(open) = trip.as_ref() else {
            return false;
        };
        if open.reason != QuotaCounter::Storage {
            return false;
        }
        let usage = self.quota.percentage_of(QuotaCounter::Storage);
        if usage >= self.threshold {
            return false;
        }
        info!(
            usage = usage,
            open_for_secs = (Utc::now() - open.opened_at).num_seconds(),
            "Storage back under threshold, closing durable store circuit"
        );
        *trip = None;
        true
    }

    fn close_after_daily_reset(&self, trip: &mut Option<Trip>) {
        let Some(open) = trip.as_ref() else {
            return;
        };
        if open.reason.is_daily() && self.quota.day() > open.day {
            info!(reason = %open.reason, "Daily quota reset, closing durable store circuit");
            *trip = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Trip>> {
        self.trip.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counters consulted before admitting an operation. Writes also grow
/// storage; deletes only shrink it.
fn relevant_counters(operation: QuotaCounter) -> &'static [QuotaCounter] {
    match operation {
        QuotaCounter::Reads => &[QuotaCounter::Reads],
        QuotaCounter::Writes | QuotaCounter::Storage => {
            &[QuotaCounter::Writes, QuotaCounter::Storage]
        }
        QuotaCounter::Deletes => &[QuotaCounter::Deletes],
    }
}
