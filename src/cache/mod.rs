//! Tiered cache of resolved lookups.
//!
//! [`CacheStore`] owns every invariant of a [`CacheEntry`]: one entry per
//! `(tax_id, tenant)`, `access_count` only grows, and `refreshed_at` is
//! never earlier than `fetched_at`. Every mutation is a single-row atomic
//! upsert on the backing [`RowStore`], so maintenance jobs and live lookups
//! can work on the cache concurrently without a cache-wide lock.
//!
//! Tiers are derived on read from `refreshed_at` (see [`CacheTier`]); the
//! purge job reclaims entries by the age of `fetched_at`.

mod entry;

pub use entry::{CacheEntry, CacheKey, CacheTier, EntrySource};

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::clock::Clock;
use crate::store::{CACHE_TABLE, MemoryStore, RowStore, SqliteStore};
use crate::types::{TaxId, TaxpayerRecord, TenantId};

/// Cache sizing and maintenance knobs (`[cache]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Entries per refresh job run. Default: 100.
    pub refresh_batch_size: usize,
    /// Entries whose first resolution is older than this are purged. Default: 90.
    pub max_age_days: i64,
    /// Access count above which an entry is priority-refreshed. Default: 10.
    pub priority_threshold: u64,
    /// Where the CLI persists the in-memory cache between runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            refresh_batch_size: 100,
            max_age_days: 90,
            priority_threshold: 10,
            snapshot_path: None,
        }
    }
}

/// Aggregate view of the cache for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub fresh: usize,
    pub refresh_zone: usize,
    pub stale: usize,
    pub expired: usize,
    /// Mean `access_count`, rounded to two decimals.
    pub avg_access_count: f64,
    /// Percentage of entries servable without an upstream call.
    pub cache_coverage: f64,
}

/// Tiered, tenant-scoped store of [`CacheEntry`] rows.
#[derive(Clone)]
pub struct CacheStore {
    rows: Arc<dyn RowStore<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(rows: Arc<dyn RowStore<CacheKey, CacheEntry>>, clock: Arc<dyn Clock>) -> Self {
        Self { rows, clock }
    }

    /// A store on a fresh [`MemoryStore`].
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryStore::<CacheKey, CacheEntry>::new()), clock)
    }

    /// A store on the shared SQLite database at `path`.
    pub fn sqlite(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let rows = SqliteStore::<CacheKey, CacheEntry>::open(path, CACHE_TABLE)?;
        Ok(Self::new(Arc::new(rows), clock))
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get(&self, tax_id: &TaxId, tenant: &TenantId) -> Result<Option<CacheEntry>> {
        self.rows
            .get(&CacheKey::new(tax_id.clone(), tenant.clone()))
    }

    /// Create or overwrite the entry for `(tax_id, tenant)` with fresh data.
    ///
    /// Sets `fetched_at` on creation, always bumps `refreshed_at`, clears
    /// `error_message`, and keeps the usage counters of an existing entry.
    pub fn upsert(
        &self,
        tax_id: &TaxId,
        tenant: &TenantId,
        data: TaxpayerRecord,
        source: EntrySource,
    ) -> Result<CacheEntry> {
        let now = self.clock.now();
        let key = CacheKey::new(tax_id.clone(), tenant.clone());

        let stored = self.rows.upsert_with(&key, &mut |current| {
            let entry = match current {
                Some(existing) => CacheEntry {
                    data: data.clone(),
                    refreshed_at: now.max(existing.fetched_at),
                    source,
                    error_message: None,
                    ..existing
                },
                None => CacheEntry {
                    tax_id: tax_id.clone(),
                    tenant: tenant.clone(),
                    data: data.clone(),
                    fetched_at: now,
                    refreshed_at: now,
                    access_count: 0,
                    last_access_at: None,
                    source,
                    error_message: None,
                },
            };
            Some(entry)
        })?;

        debug!(tax_id = %tax_id, tenant = %tenant, source = source.as_str(), "cache upsert");
        stored.ok_or_else(|| {
            crate::CedulaError::Storage(format!("upsert of {key} did not persist a row"))
        })
    }

    /// Record one serve of `entry`: bump `access_count`, stamp `last_access_at`.
    ///
    /// Returns the updated entry. If the row vanished meanwhile (purged),
    /// it is not recreated and the bump is only reflected in the return value.
    pub fn mark_accessed(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let now = self.clock.now();
        let updated = self.rows.upsert_with(&entry.key(), &mut |current| {
            current.map(|mut e| {
                e.access_count = e.access_count.saturating_add(1);
                e.last_access_at = Some(now);
                e
            })
        })?;

        Ok(updated.unwrap_or_else(|| {
            let mut local = entry.clone();
            local.access_count = local.access_count.saturating_add(1);
            local.last_access_at = Some(now);
            local
        }))
    }

    /// Attach a refresh failure to an existing entry. Data stays servable.
    pub fn record_error(
        &self,
        tax_id: &TaxId,
        tenant: &TenantId,
        message: &str,
    ) -> Result<Option<CacheEntry>> {
        let key = CacheKey::new(tax_id.clone(), tenant.clone());
        self.rows.upsert_with(&key, &mut |current| {
            current.map(|mut e| {
                e.error_message = Some(message.to_string());
                e
            })
        })
    }

    /// Delete one entry.
    pub fn invalidate(&self, tax_id: &TaxId, tenant: &TenantId) -> Result<Option<CacheEntry>> {
        self.rows
            .remove(&CacheKey::new(tax_id.clone(), tenant.clone()))
    }

    fn scan_tenant(&self, tenant: Option<&TenantId>) -> Result<Vec<CacheEntry>> {
        Ok(self
            .rows
            .scan()?
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| tenant.is_none_or(|t| &e.tenant == t))
            .collect())
    }

    /// Entries due for refresh (refresh zone or stale, not expired), most
    /// used first, oldest refresh breaking ties.
    pub fn list_stale(&self, tenant: Option<&TenantId>, limit: usize) -> Result<Vec<CacheEntry>> {
        let now = self.clock.now();
        let mut entries: Vec<_> = self
            .scan_tenant(tenant)?
            .into_iter()
            .filter(|e| matches!(e.tier(now), CacheTier::RefreshZone | CacheTier::Stale))
            .collect();
        entries.sort_by_key(|e| (Reverse(e.access_count), e.refreshed_at));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Entries whose first resolution is more than `max_age_days` old.
    pub fn list_expired(
        &self,
        tenant: Option<&TenantId>,
        max_age_days: i64,
    ) -> Result<Vec<CacheEntry>> {
        let now = self.clock.now();
        Ok(self
            .scan_tenant(tenant)?
            .into_iter()
            .filter(|e| e.fetched_age_days(now) > max_age_days)
            .collect())
    }

    /// Delete expired entries, returning how many were removed per tenant.
    pub fn purge_expired_by_tenant(
        &self,
        tenant: Option<&TenantId>,
        max_age_days: i64,
    ) -> Result<BTreeMap<TenantId, usize>> {
        let mut purged: BTreeMap<TenantId, usize> = BTreeMap::new();
        for entry in self.list_expired(tenant, max_age_days)? {
            if self.rows.remove(&entry.key())?.is_some() {
                *purged.entry(entry.tenant).or_default() += 1;
            }
        }
        Ok(purged)
    }

    /// Delete expired entries, returning the count removed.
    pub fn purge_expired(&self, tenant: Option<&TenantId>, max_age_days: i64) -> Result<usize> {
        Ok(self
            .purge_expired_by_tenant(tenant, max_age_days)?
            .values()
            .sum())
    }

    /// Heavily used entries (`access_count > threshold`) regardless of tier,
    /// most used first.
    pub fn list_priority(
        &self,
        tenant: Option<&TenantId>,
        threshold: u64,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<_> = self
            .scan_tenant(tenant)?
            .into_iter()
            .filter(|e| e.access_count > threshold)
            .collect();
        entries.sort_by_key(|e| Reverse(e.access_count));
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn statistics(&self, tenant: Option<&TenantId>) -> Result<CacheStatistics> {
        let now = self.clock.now();
        let entries = self.scan_tenant(tenant)?;
        let mut stats = CacheStatistics {
            total_entries: entries.len(),
            ..CacheStatistics::default()
        };
        if entries.is_empty() {
            return Ok(stats);
        }

        let mut accesses: u64 = 0;
        for e in &entries {
            accesses = accesses.saturating_add(e.access_count);
            match e.tier(now) {
                CacheTier::Fresh => stats.fresh += 1,
                CacheTier::RefreshZone => stats.refresh_zone += 1,
                CacheTier::Stale => stats.stale += 1,
                CacheTier::Expired => stats.expired += 1,
            }
        }

        let total = stats.total_entries as f64;
        stats.avg_access_count = round2(accesses as f64 / total);
        stats.cache_coverage = round2((stats.fresh + stats.refresh_zone) as f64 / total * 100.0);
        Ok(stats)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
