use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::DocumentStore;
use crate::models::cache::CacheEntry;
use crate::models::job::JobResult;
use crate::models::quota::QuotaCounter;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::periodic::spawn_periodic;
use crate::services::quota::QuotaMonitor;

/// Fingerprint-keyed cache of compute results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Fresh entry for `fingerprint`. Expired entries count as absent and
    /// are removed on the way out.
    async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry>;

    async fn store(&self, fingerprint: &str, result: JobResult, ttl: Duration);
}

#[derive(Default)]
pub struct MemoryResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }

    pub fn spawn_purge(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        spawn_periodic("transient-cache-purge", period, token, move || {
            let cache = Arc::clone(&cache);
            async move {
                let purged = cache.purge_expired();
                if purged > 0 {
                    info!(purged, "Purged expired transient cache entries");
                }
            }
        })
    }

    fn lookup_sync(&self, fingerprint: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()?;

        if entry.is_expired_at(now) {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(fingerprint);
            debug!(fingerprint, "Dropped expired cache entry");
            return None;
        }
        Some(entry)
    }

    fn insert_sync(&self, entry: CacheEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.fingerprint.clone(), entry);
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.lookup_sync(fingerprint)
    }

    async fn store(&self, fingerprint: &str, result: JobResult, ttl: Duration) {
        self.insert_sync(CacheEntry::new(fingerprint, result, ttl, Utc::now()));
    }
}

/// Quota-tracked result cache over the durable backend.
pub struct DurableResultCache {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaMonitor>,
    fallback: Arc<MemoryResultCache>,
}

impl DurableResultCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<MemoryResultCache>,
    ) -> Self {
        let quota = Arc::clone(breaker.quota());
        Self {
            store,
            breaker,
            quota,
            fallback,
        }
    }

    async fn remove_expired(&self, entry: &CacheEntry) {
        let removed = self
            .breaker
            .call(QuotaCounter::Deletes, || {
                self.store.delete_cache_entry(&entry.fingerprint)
            })
            .await;
        if let Some(removed) = removed {
            self.quota
                .record_delete(if removed { entry.size_bytes() } else { 0 });
            debug!(fingerprint = %entry.fingerprint, "Dropped expired cache entry");
        }
    }
}

#[async_trait]
impl ResultCache for DurableResultCache {
    async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        let durable = self
            .breaker
            .call(QuotaCounter::Reads, || self.store.get_cache_entry(fingerprint))
            .await;

        match durable {
            Some(Some(entry)) => {
                self.quota.record_read(1);
                if entry.is_expired_at(Utc::now()) {
                    self.remove_expired(&entry).await;
                    return self.fallback.lookup_sync(fingerprint);
                }
                Some(entry)
            }
            Some(None) => {
                self.quota.record_read(1);
                self.fallback.lookup_sync(fingerprint)
            }
            None => self.fallback.lookup_sync(fingerprint),
        }
    }

    async fn store(&self, fingerprint: &str, result: JobResult, ttl: Duration) {
        let entry = CacheEntry::new(fingerprint, result, ttl, Utc::now());
        let existing = self
            .breaker
            .call(QuotaCounter::Reads, || self.store.get_cache_entry(fingerprint))
            .await;
        let Some(existing) = existing else {
            debug!(fingerprint, "Cache entry unreadable, write served by transient store");
            self.fallback.insert_sync(entry);
            return;
        };
        self.quota.record_read(1);

        let previous_size = existing.as_ref().map_or(0, CacheEntry::size_bytes);
        let size = entry.size_bytes();
        let written = self
            .breaker
            .call(QuotaCounter::Writes, || self.store.put_cache_entry(&entry))
            .await;

        match written {
            Some(()) => self
                .quota
                .record_write(size as i64 - previous_size as i64),
            None => {
                debug!(fingerprint, "Cache write served by transient store");
                self.fallback.insert_sync(entry);
            }
        }
    }
}
