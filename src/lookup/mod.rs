//! Waterfall resolution of tax ids.
//!
//! ```text
//! validate ─► cache (fresh | refresh zone) ─► done (+ background refresh)
//!                │ miss / force
//!                ▼
//!          rate-limit token ── none ──► RateLimitExceeded
//!                ▼
//!            registry ── ok ──► upsert, done
//!                │ not found ──► negative entry, ManualEntryRequired
//!                │ fail
//!                ▼
//!             mirror ── ok ──► upsert, done
//!                │ fail
//!                ▼
//!          stale entry ── yes ──► done with warning
//!                │ no
//!                ▼
//!        ManualEntryRequired
//! ```
//!
//! The request path never waits on the rate limiter: a burst beyond the
//! bucket is rejected, not queued. Concurrent misses for the same id may
//! both reach the registry; the cache upsert is idempotent.

mod result;

pub use result::{BatchLookup, BatchOutcome, BatchSummary, LookupResult, ResultSource, ServiceHealth};

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore, CacheTier, EntrySource};
use crate::limiter::RateLimiter;
use crate::registry::RegistryProvider;
use crate::telemetry;
use crate::types::{QuickVerification, TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, Result};

/// Default number of ids resolved concurrently by a batch lookup.
const DEFAULT_BATCH_CONCURRENCY: usize = 5;
/// A refresh-zone hit schedules at most one background refresh per key
/// within this window.
const REFRESH_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Resolves tax ids through cache, registry, mirror and stale cache.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LookupService {
    inner: Arc<Inner>,
}

struct Inner {
    cache: CacheStore,
    limiter: RateLimiter,
    registry: Arc<dyn RegistryProvider>,
    mirror: Option<Arc<dyn RegistryProvider>>,
    refreshing: moka::sync::Cache<CacheKey, ()>,
    batch_concurrency: usize,
}

impl LookupService {
    pub fn new(
        cache: CacheStore,
        limiter: RateLimiter,
        registry: Arc<dyn RegistryProvider>,
        mirror: Option<Arc<dyn RegistryProvider>>,
    ) -> Self {
        Self::with_batch_concurrency(cache, limiter, registry, mirror, DEFAULT_BATCH_CONCURRENCY)
    }

    pub fn with_batch_concurrency(
        cache: CacheStore,
        limiter: RateLimiter,
        registry: Arc<dyn RegistryProvider>,
        mirror: Option<Arc<dyn RegistryProvider>>,
        batch_concurrency: usize,
    ) -> Self {
        let refreshing = moka::sync::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(REFRESH_DEDUP_WINDOW)
            .build();
        Self {
            inner: Arc::new(Inner {
                cache,
                limiter,
                registry,
                mirror,
                refreshing,
                batch_concurrency: batch_concurrency.max(1),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// The primary registry, as used on the request path.
    pub fn registry(&self) -> &Arc<dyn RegistryProvider> {
        &self.inner.registry
    }

    /// Resolve one tax id for `tenant`.
    ///
    /// `force_refresh` skips the cache-serve step but still allows the
    /// stale-cache fallback.
    pub async fn lookup(
        &self,
        tax_id: &str,
        tenant: &TenantId,
        force_refresh: bool,
    ) -> Result<LookupResult> {
        let start = Instant::now();
        let result = self.resolve(tax_id, tenant, force_refresh).await;

        metrics::histogram!(telemetry::LOOKUP_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        let (source, status) = match &result {
            Ok(r) if r.is_stale => ("stale_cache", "ok"),
            Ok(r) => (r.source.as_str(), "ok"),
            Err(_) => ("none", "error"),
        };
        metrics::counter!(telemetry::LOOKUPS_TOTAL, "source" => source, "status" => status)
            .increment(1);
        result
    }

    async fn resolve(
        &self,
        raw: &str,
        tenant: &TenantId,
        force_refresh: bool,
    ) -> Result<LookupResult> {
        let tax_id = TaxId::parse(raw)?;
        let cache = &self.inner.cache;

        if !force_refresh {
            let now = cache.now();
            if let Some(entry) = self.read_cache(&tax_id, tenant) {
                let tier = entry.tier(now);
                if tier.is_servable() {
                    metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier.as_str())
                        .increment(1);
                    let entry = cache.mark_accessed(&entry)?;
                    if entry.is_negative() {
                        debug!(tax_id = %tax_id, tenant = %tenant, "negative cache hit");
                        return Err(CedulaError::NotFound {
                            tax_id: tax_id.to_string(),
                        });
                    }
                    let refresh_scheduled =
                        tier == CacheTier::RefreshZone && self.schedule_refresh(&tax_id, tenant);
                    debug!(tax_id = %tax_id, tenant = %tenant, tier = tier.as_str(), "cache hit");
                    return Ok(from_entry(&entry, tier, now, refresh_scheduled, None));
                }
            }
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        }

        if !self.inner.limiter.try_acquire() {
            return Err(CedulaError::RateLimitExceeded(format!(
                "registry lookup for {tax_id} rejected, too many requests in flight; retry later"
            )));
        }

        let registry_err = match self.inner.registry.lookup(tenant, &tax_id).await {
            Ok(record) => {
                return self.store_fresh(&tax_id, tenant, record, EntrySource::Registry);
            }
            Err(CedulaError::NotFound { .. }) => {
                info!(tax_id = %tax_id, tenant = %tenant, "registry confirmed tax id does not exist");
                cache.upsert(
                    &tax_id,
                    tenant,
                    TaxpayerRecord::not_found(tax_id.clone()),
                    EntrySource::Registry,
                )?;
                return Err(CedulaError::ManualEntryRequired {
                    tax_id: tax_id.to_string(),
                    reason: "not found in the registry".to_string(),
                });
            }
            Err(e) => {
                warn!(tax_id = %tax_id, tenant = %tenant, error = %e, "registry lookup failed");
                e
            }
        };

        let mirror_err = match &self.inner.mirror {
            None => "not configured".to_string(),
            Some(_) if !self.inner.limiter.try_acquire() => "rate limited".to_string(),
            Some(mirror) => match mirror.lookup(tenant, &tax_id).await {
                Ok(record) => {
                    return self.store_fresh(&tax_id, tenant, record, EntrySource::Mirror);
                }
                Err(e) => {
                    warn!(tax_id = %tax_id, tenant = %tenant, error = %e, "mirror lookup failed");
                    e.to_string()
                }
            },
        };

        let now = cache.now();
        if let Some(entry) = self.read_cache(&tax_id, tenant) {
            let tier = entry.tier(now);
            if tier != CacheTier::Expired && !entry.is_negative() {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier.as_str())
                    .increment(1);
                let entry = cache.mark_accessed(&entry)?;
                let age = entry.age_days(now);
                warn!(tax_id = %tax_id, tenant = %tenant, age_days = age, "serving stale cache entry");
                let warning = format!(
                    "registry and mirror unavailable; showing data last verified {age} days ago, confirm it with the customer"
                );
                let mut result = from_entry(&entry, tier, now, false, Some(warning));
                result.is_stale = true;
                result.is_fresh = false;
                return Ok(result);
            }
        }

        Err(CedulaError::ManualEntryRequired {
            tax_id: tax_id.to_string(),
            reason: format!("registry: {registry_err}; mirror: {mirror_err}"),
        })
    }

    fn read_cache(&self, tax_id: &TaxId, tenant: &TenantId) -> Option<CacheEntry> {
        match self.inner.cache.get(tax_id, tenant) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(tax_id = %tax_id, tenant = %tenant, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    fn store_fresh(
        &self,
        tax_id: &TaxId,
        tenant: &TenantId,
        record: TaxpayerRecord,
        source: EntrySource,
    ) -> Result<LookupResult> {
        let entry = self.inner.cache.upsert(tax_id, tenant, record, source)?;
        let source = match source {
            EntrySource::Registry => ResultSource::Registry,
            EntrySource::Mirror => ResultSource::Mirror,
        };
        info!(tax_id = %tax_id, tenant = %tenant, source = source.as_str(), "tax id resolved");
        Ok(LookupResult {
            tax_id: tax_id.clone(),
            tenant: tenant.clone(),
            verification: QuickVerification::from_entry(&entry),
            source,
            tier: CacheTier::Fresh,
            is_fresh: true,
            is_stale: false,
            cache_age_days: 0,
            refresh_scheduled: false,
            access_count: entry.access_count,
            warning: None,
            data: entry.data,
        })
    }

    /// Spawn a best-effort registry refresh for a refresh-zone hit.
    ///
    /// Returns whether a refresh was started. Skipped when one was started
    /// for the same key within the dedup window, when there is no token,
    /// or outside a tokio runtime.
    fn schedule_refresh(&self, tax_id: &TaxId, tenant: &TenantId) -> bool {
        let key = CacheKey::new(tax_id.clone(), tenant.clone());
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        if !self.inner.refreshing.entry(key.clone()).or_insert(()).is_fresh() {
            return false;
        }
        if !self.inner.limiter.try_acquire() {
            self.inner.refreshing.invalidate(&key);
            debug!(key = %key, "no token for background refresh");
            return false;
        }

        let inner = self.inner.clone();
        let tax_id = tax_id.clone();
        let tenant = tenant.clone();
        runtime.spawn(async move {
            let outcome = match inner.registry.lookup(&tenant, &tax_id).await {
                Ok(record) => inner
                    .cache
                    .upsert(&tax_id, &tenant, record, EntrySource::Registry)
                    .map(|_| ()),
                Err(CedulaError::NotFound { .. }) => inner
                    .cache
                    .upsert(
                        &tax_id,
                        &tenant,
                        TaxpayerRecord::not_found(tax_id.clone()),
                        EntrySource::Registry,
                    )
                    .map(|_| ()),
                Err(e) => inner
                    .cache
                    .record_error(&tax_id, &tenant, &e.to_string())
                    .map(|_| ()),
            };
            match outcome {
                Ok(()) => debug!(tax_id = %tax_id, tenant = %tenant, "background refresh done"),
                Err(e) => warn!(tax_id = %tax_id, tenant = %tenant, error = %e, "background refresh failed"),
            }
        });
        true
    }

    /// Resolve many ids; one id's failure never aborts the batch.
    ///
    /// Up to the configured concurrency (default 5) ids are in flight.
    /// Duplicate ids are resolved once.
    pub async fn batch_lookup(&self, tax_ids: &[&str], tenant: &TenantId) -> BatchLookup {
        let mut unique: Vec<&str> = tax_ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let outcomes: Vec<(String, BatchOutcome)> = stream::iter(unique)
            .map(|id| async move {
                let outcome = BatchOutcome::from(self.lookup(id, tenant, false).await);
                (id.to_string(), outcome)
            })
            .buffer_unordered(self.inner.batch_concurrency)
            .collect()
            .await;

        let mut batch = BatchLookup::default();
        for (id, outcome) in outcomes {
            batch.summary.total += 1;
            match outcome.result() {
                Some(r) => {
                    batch.summary.succeeded += 1;
                    match r.source {
                        ResultSource::Cache => batch.summary.cache_hits += 1,
                        ResultSource::Registry | ResultSource::Mirror => {
                            batch.summary.upstream_calls += 1
                        }
                    }
                }
                None => batch.summary.failed += 1,
            }
            batch.results.insert(id, outcome);
        }
        info!(
            tenant = %tenant,
            total = batch.summary.total,
            failed = batch.summary.failed,
            "batch lookup complete"
        );
        batch
    }

    /// Cache statistics and limiter state in one view.
    pub fn health(&self, tenant: Option<&TenantId>) -> Result<ServiceHealth> {
        Ok(ServiceHealth {
            cache: self.inner.cache.statistics(tenant)?,
            rate_limiter: self.inner.limiter.available_tokens()?,
            mirror_configured: self.inner.mirror.is_some(),
        })
    }
}

fn from_entry(
    entry: &CacheEntry,
    tier: CacheTier,
    now: chrono::DateTime<chrono::Utc>,
    refresh_scheduled: bool,
    warning: Option<String>,
) -> LookupResult {
    LookupResult {
        tax_id: entry.tax_id.clone(),
        tenant: entry.tenant.clone(),
        data: entry.data.clone(),
        source: ResultSource::Cache,
        tier,
        is_fresh: true,
        is_stale: false,
        cache_age_days: entry.age_days(now),
        refresh_scheduled,
        access_count: entry.access_count,
        warning,
        verification: QuickVerification::from_entry(entry),
    }
}
