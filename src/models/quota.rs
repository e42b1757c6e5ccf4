use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// A tracked dimension of durable-store usage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaCounter {
    Reads,
    Writes,
    Deletes,
    /// Cumulative stored bytes; not reset at the day boundary.
    Storage,
}

impl QuotaCounter {
    pub fn is_daily(self) -> bool {
        !matches!(self, Self::Storage)
    }
}

/// Usage for one UTC day, plus cumulative storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub day: NaiveDate,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub storage_bytes: u64,
}

impl QuotaSnapshot {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            reads: 0,
            writes: 0,
            deletes: 0,
            storage_bytes: 0,
        }
    }

    pub fn get(&self, counter: QuotaCounter) -> u64 {
        match counter {
            QuotaCounter::Reads => self.reads,
            QuotaCounter::Writes => self.writes,
            QuotaCounter::Deletes => self.deletes,
            QuotaCounter::Storage => self.storage_bytes,
        }
    }

    pub fn set(&mut self, counter: QuotaCounter, value: u64) {
        match counter {
            QuotaCounter::Reads => self.reads = value,
            QuotaCounter::Writes => self.writes = value,
            QuotaCounter::Deletes => self.deletes = value,
            QuotaCounter::Storage => self.storage_bytes = value,
        }
    }

    /// Snapshot for a later day: daily counters reset, storage carries over.
    pub fn carried_into(&self, day: NaiveDate) -> Self {
        Self {
            storage_bytes: self.storage_bytes,
            ..Self::empty(day)
        }
    }
}

/// Daily ceilings shared by every tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub storage_bytes: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            reads: 50_000,
            writes: 20_000,
            deletes: 20_000,
            storage_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl QuotaLimits {
    pub fn get(&self, counter: QuotaCounter) -> u64 {
        match counter {
            QuotaCounter::Reads => self.reads,
            QuotaCounter::Writes => self.writes,
            QuotaCounter::Deletes => self.deletes,
            QuotaCounter::Storage => self.storage_bytes,
        }
    }
}

/// Response body for `GET /_internal/storage-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub enabled: bool,
    pub circuit_breaker: BreakerReport,
    pub quotas: QuotaReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_operation: Option<QuotaCounter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub reads: CounterUsage,
    pub writes: CounterUsage,
    pub deletes: CounterUsage,
    pub storage: StorageUsage,
}

/// Percentages in reports are 0-100 with two decimals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterUsage {
    pub current: u64,
    pub limit: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub current_bytes: u64,
    pub limit_bytes: u64,
    pub percentage: f64,
}
