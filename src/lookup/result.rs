//! Lookup outcomes.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cache::{CacheStatistics, CacheTier};
use crate::limiter::BucketSnapshot;
use crate::types::{QuickVerification, TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, ErrorKind};

/// Where a lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Registry,
    Mirror,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Cache => "cache",
            ResultSource::Registry => "registry",
            ResultSource::Mirror => "mirror",
        }
    }
}

/// A resolved tax id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupResult {
    pub tax_id: TaxId,
    pub tenant: TenantId,
    pub data: TaxpayerRecord,
    pub source: ResultSource,
    /// Tier of the data at the time it was served (`fresh` for upstream answers).
    pub tier: CacheTier,
    /// Served through the normal path rather than as a fallback.
    pub is_fresh: bool,
    /// Served from a stale cache entry after both upstreams failed.
    pub is_stale: bool,
    pub cache_age_days: i64,
    /// A background refresh was scheduled by this call.
    pub refresh_scheduled: bool,
    /// Usage count of the cache entry after this call.
    pub access_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub verification: QuickVerification,
}

/// Per-id outcome of a batch lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Found(Box<LookupResult>),
    Failed { error: String, kind: ErrorKind },
}

impl BatchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, BatchOutcome::Found(_))
    }

    pub fn result(&self) -> Option<&LookupResult> {
        match self {
            BatchOutcome::Found(r) => Some(r),
            BatchOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            BatchOutcome::Found(_) => None,
            BatchOutcome::Failed { error, .. } => Some(error),
        }
    }
}

impl From<Result<LookupResult, CedulaError>> for BatchOutcome {
    fn from(r: Result<LookupResult, CedulaError>) -> Self {
        match r {
            Ok(result) => BatchOutcome::Found(Box::new(result)),
            Err(e) => BatchOutcome::Failed {
                error: e.to_string(),
                kind: e.kind(),
            },
        }
    }
}

/// Counters over a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub upstream_calls: usize,
}

/// Result of [`LookupService::batch_lookup`](super::LookupService::batch_lookup).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchLookup {
    /// Keyed by the tax id exactly as requested.
    pub results: BTreeMap<String, BatchOutcome>,
    pub summary: BatchSummary,
}

/// Combined dashboard view of the lookup service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub cache: CacheStatistics,
    pub rate_limiter: BucketSnapshot,
    pub mirror_configured: bool,
}
