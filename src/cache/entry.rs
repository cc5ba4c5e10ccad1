//! Cache entry model and freshness tiers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TaxId, TaxpayerRecord, TenantId};

/// Identity of a cache entry. Exactly one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub tax_id: TaxId,
    pub tenant: TenantId,
}

impl CacheKey {
    pub fn new(tax_id: TaxId, tenant: TenantId) -> Self {
        Self { tax_id, tenant }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tax_id, self.tenant)
    }
}

/// Upstream that produced an entry's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Registry,
    Mirror,
}

impl EntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntrySource::Registry => "registry",
            EntrySource::Mirror => "mirror",
        }
    }
}

/// Freshness tier derived from the age of `refreshed_at` in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Under 5 days. Served without contacting the registry.
    Fresh,
    /// 5 to 7 days. Served, and a background refresh is scheduled.
    RefreshZone,
    /// 8 to 90 days. Served only after both upstreams fail.
    Stale,
    /// Over 90 days. Never served; reclaimed by the purge job.
    Expired,
}

impl CacheTier {
    pub fn from_age_days(days: i64) -> Self {
        match days {
            d if d > 90 => CacheTier::Expired,
            d if d > 7 => CacheTier::Stale,
            d if d >= 5 => CacheTier::RefreshZone,
            _ => CacheTier::Fresh,
        }
    }

    /// Whether an entry in this tier may be served without an upstream call.
    pub fn is_servable(&self) -> bool {
        matches!(self, CacheTier::Fresh | CacheTier::RefreshZone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Fresh => "fresh",
            CacheTier::RefreshZone => "refresh_zone",
            CacheTier::Stale => "stale",
            CacheTier::Expired => "expired",
        }
    }
}

/// A resolved lookup result with usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tax_id: TaxId,
    pub tenant: TenantId,
    pub data: TaxpayerRecord,
    /// First successful resolution.
    pub fetched_at: DateTime<Utc>,
    /// Last successful re-resolution. Never earlier than `fetched_at`.
    pub refreshed_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access_at: Option<DateTime<Utc>>,
    pub source: EntrySource,
    /// Last refresh failure, cleared by the next successful upsert.
    pub error_message: Option<String>,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.tax_id.clone(), self.tenant.clone())
    }

    /// Whole days since the last refresh (never negative).
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.refreshed_at).num_days().max(0)
    }

    /// Whole days since the first resolution (never negative).
    pub fn fetched_age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.fetched_at).num_days().max(0)
    }

    pub fn tier(&self, now: DateTime<Utc>) -> CacheTier {
        CacheTier::from_age_days(self.age_days(now))
    }

    /// In the refresh zone: still served, but due for re-resolution.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.tier(now) == CacheTier::RefreshZone
    }

    /// Whether this entry records a confirmed not-found answer.
    pub fn is_negative(&self) -> bool {
        self.data.tax_status == crate::types::TaxStatus::NoEncontrado
    }
}
