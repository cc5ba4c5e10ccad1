//! Denormalized "is this customer record still trustworthy" flag.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{TaxStatus, TaxpayerRecord};
use crate::cache::CacheEntry;

/// Verification flag attached to a consuming partner/customer record.
///
/// Independent of cache tiers: staleness depends on the last known tax
/// status. Active taxpayers are re-checked daily, failed lookups weekly,
/// confirmed not-found ids monthly. Any other status is always stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickVerification {
    pub verified: bool,
    pub tax_status: TaxStatus,
    pub last_sync_at: DateTime<Utc>,
}

impl QuickVerification {
    /// Flag for a record resolved at `at`.
    pub fn from_record(record: &TaxpayerRecord, at: DateTime<Utc>) -> Self {
        Self {
            verified: record.tax_status == TaxStatus::Inscrito,
            tax_status: record.tax_status,
            last_sync_at: at,
        }
    }

    /// Flag for a cache entry, synced as of its last refresh.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self::from_record(&entry.data, entry.refreshed_at)
    }

    /// Age after which the flag should be re-synced, if the status has one.
    pub fn max_age(status: TaxStatus) -> Option<Duration> {
        match status {
            TaxStatus::Inscrito => Some(Duration::hours(24)),
            TaxStatus::Error => Some(Duration::days(7)),
            TaxStatus::NoEncontrado => Some(Duration::days(30)),
            _ => None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match Self::max_age(self.tax_status) {
            Some(max) => now - self.last_sync_at > max,
            None => true,
        }
    }
}
