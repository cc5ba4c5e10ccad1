//! Scheduled cache maintenance.
//!
//! Three independent jobs, meant to be triggered by an external scheduler
//! (cron, systemd timer, k8s CronJob):
//!
//! - [`MaintenanceScheduler::refresh_stale_job`] re-resolves refresh-zone
//!   and stale entries, most used first.
//! - [`MaintenanceScheduler::purge_expired_job`] deletes entries whose first
//!   resolution is older than `max_age_days`.
//! - [`MaintenanceScheduler::priority_refresh_job`] re-resolves heavily used
//!   entries regardless of tier.
//!
//! Jobs never return an error: per-item failures land in the report's
//! `failed` counter and on the entry's `error_message`. They only touch one
//! cache row at a time, so they run safely next to live lookups. Outbound
//! calls wait on the shared rate limiter (the blocking variant), which
//! paces a batch at the bucket's refill rate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{CacheEntry, CachePolicy, CacheStore, EntrySource};
use crate::limiter::RateLimiter;
use crate::lookup::LookupService;
use crate::registry::RegistryProvider;
use crate::telemetry;
use crate::types::{TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, Result};

/// Error samples kept per report.
const MAX_ERROR_SAMPLES: usize = 5;
/// Longest error text stored on a cache entry.
const MAX_ERROR_MESSAGE: usize = 500;
/// Failure rate above which a job raises an alert.
const ALERT_FAILURE_RATE: f64 = 0.5;
/// Default wait for a rate-limiter token per item.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which job produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RefreshStale,
    PurgeExpired,
    PriorityRefresh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RefreshStale => "refresh_stale",
            JobKind::PurgeExpired => "purge_expired",
            JobKind::PriorityRefresh => "priority_refresh",
        }
    }
}

/// One failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub tax_id: String,
    pub tenant: String,
    pub error: String,
}

/// Statistics returned by every job run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job: JobKind,
    /// False only when the job could not run at all (e.g. storage down).
    pub success: bool,
    pub processed: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub purged: usize,
    /// Purged entries per tenant.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_tenant: BTreeMap<TenantId, usize>,
    /// The first few failures.
    pub errors: Vec<JobError>,
    pub alerted: bool,
    pub duration_seconds: f64,
}

impl JobReport {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            success: true,
            processed: 0,
            refreshed: 0,
            failed: 0,
            purged: 0,
            by_tenant: BTreeMap::new(),
            errors: Vec::new(),
            alerted: false,
            duration_seconds: 0.0,
        }
    }

    /// `failed / processed`, 0 for an empty run.
    pub fn failure_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }

    fn push_error(&mut self, tax_id: &str, tenant: &str, error: String) {
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(JobError {
                tax_id: tax_id.to_string(),
                tenant: tenant.to_string(),
                error,
            });
        }
    }
}

/// Receives operational alerts from maintenance jobs.
pub trait AlertSink: Send + Sync {
    fn job_alert(&self, report: &JobReport);
}

/// Default sink: an `error!` event carrying the report counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn job_alert(&self, report: &JobReport) {
        let samples: Vec<String> = report
            .errors
            .iter()
            .map(|e| format!("{}@{}: {}", e.tax_id, e.tenant, e.error))
            .collect();
        error!(
            job = report.job.as_str(),
            processed = report.processed,
            failed = report.failed,
            failure_rate = report.failure_rate(),
            duration_seconds = report.duration_seconds,
            samples = ?samples,
            "maintenance job failure rate above threshold"
        );
    }
}

/// Runs the cache maintenance jobs.
pub struct MaintenanceScheduler {
    cache: CacheStore,
    limiter: RateLimiter,
    registry: Arc<dyn RegistryProvider>,
    policy: CachePolicy,
    acquire_timeout: Duration,
    alerts: Arc<dyn AlertSink>,
}

impl MaintenanceScheduler {
    pub fn new(
        cache: CacheStore,
        limiter: RateLimiter,
        registry: Arc<dyn RegistryProvider>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            cache,
            limiter,
            registry,
            policy,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            alerts: Arc::new(TracingAlertSink),
        }
    }

    /// Share the cache, limiter and registry of a lookup service.
    pub fn for_service(service: &LookupService, policy: CachePolicy) -> Self {
        Self::new(
            service.cache().clone(),
            service.limiter().clone(),
            service.registry().clone(),
            policy,
        )
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// How long each item may wait for a rate-limiter token.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Re-resolve up to `refresh_batch_size` refresh-zone/stale entries.
    pub async fn refresh_stale_job(&self) -> JobReport {
        let start = Instant::now();
        info!(batch_size = self.policy.refresh_batch_size, "refresh-stale job started");
        let entries = self.cache.list_stale(None, self.policy.refresh_batch_size);
        self.refresh_entries(JobKind::RefreshStale, entries, start).await
    }

    /// Re-resolve entries used more than `priority_threshold` times.
    pub async fn priority_refresh_job(&self) -> JobReport {
        let start = Instant::now();
        info!(threshold = self.policy.priority_threshold, "priority-refresh job started");
        let entries = self.cache.list_priority(
            None,
            self.policy.priority_threshold,
            self.policy.refresh_batch_size,
        );
        self.refresh_entries(JobKind::PriorityRefresh, entries, start).await
    }

    /// Delete entries older than `max_age_days`, counted per tenant.
    pub async fn purge_expired_job(&self) -> JobReport {
        let start = Instant::now();
        let mut report = JobReport::new(JobKind::PurgeExpired);

        match self
            .cache
            .purge_expired_by_tenant(None, self.policy.max_age_days)
        {
            Ok(by_tenant) => {
                report.purged = by_tenant.values().sum();
                report.processed = report.purged;
                for (tenant, count) in &by_tenant {
                    info!(tenant = %tenant, purged = count, "purged expired cache entries");
                }
                report.by_tenant = by_tenant;
                metrics::counter!(telemetry::JOB_ITEMS_TOTAL,
                    "job" => JobKind::PurgeExpired.as_str(), "status" => "purged")
                .increment(report.purged as u64);
            }
            Err(e) => {
                error!(error = %e, "purge-expired job could not run");
                report.success = false;
                report.push_error("", "", e.to_string());
            }
        }

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            purged = report.purged,
            max_age_days = self.policy.max_age_days,
            duration_seconds = report.duration_seconds,
            "purge-expired job complete"
        );
        report
    }

    async fn refresh_entries(
        &self,
        job: JobKind,
        entries: Result<Vec<CacheEntry>>,
        start: Instant,
    ) -> JobReport {
        let mut report = JobReport::new(job);
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                error!(job = job.as_str(), error = %e, "maintenance job could not list entries");
                report.success = false;
                report.push_error("", "", e.to_string());
                report.duration_seconds = start.elapsed().as_secs_f64();
                return report;
            }
        };

        for entry in &entries {
            report.processed += 1;
            match self.refresh_one(&entry.tax_id, &entry.tenant).await {
                Ok(()) => {
                    report.refreshed += 1;
                    metrics::counter!(telemetry::JOB_ITEMS_TOTAL,
                        "job" => job.as_str(), "status" => "refreshed")
                    .increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!(telemetry::JOB_ITEMS_TOTAL,
                        "job" => job.as_str(), "status" => "failed")
                    .increment(1);
                    let message = truncate(&e.to_string(), MAX_ERROR_MESSAGE);
                    warn!(
                        job = job.as_str(),
                        tax_id = %entry.tax_id,
                        tenant = %entry.tenant,
                        error = %message,
                        "refresh failed"
                    );
                    if let Err(store_err) =
                        self.cache
                            .record_error(&entry.tax_id, &entry.tenant, &message)
                    {
                        warn!(tax_id = %entry.tax_id, error = %store_err, "could not record refresh error");
                    }
                    report.push_error(entry.tax_id.as_str(), entry.tenant.as_str(), message);
                }
            }
        }

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            job = job.as_str(),
            processed = report.processed,
            refreshed = report.refreshed,
            failed = report.failed,
            duration_seconds = report.duration_seconds,
            "maintenance job complete"
        );

        if report.failure_rate() > ALERT_FAILURE_RATE {
            report.alerted = true;
            metrics::counter!(telemetry::JOB_ALERTS_TOTAL, "job" => job.as_str()).increment(1);
            self.alerts.job_alert(&report);
        }
        report
    }

    /// Registry round-trip for one entry, bypassing the cache-serve step.
    async fn refresh_one(&self, tax_id: &TaxId, tenant: &TenantId) -> Result<()> {
        self.limiter.acquire(self.acquire_timeout).await?;
        let record = match self.registry.lookup(tenant, tax_id).await {
            Ok(record) => record,
            Err(CedulaError::NotFound { .. }) => TaxpayerRecord::not_found(tax_id.clone()),
            Err(e) => return Err(e),
        };
        self.cache
            .upsert(tax_id, tenant, record, EntrySource::Registry)?;
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
