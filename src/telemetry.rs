//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus,
//! statsd); without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `cedula_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider` — upstream name ("hacienda", "mirror")
//! - `operation` — upstream call ("lookup", "submit", "status", "token")
//! - `source` — where a lookup was answered from ("cache", "registry", "mirror", "stale_cache")
//! - `status` — outcome: "ok" or "error"
//! - `job` — maintenance job name

/// Total lookups answered by the waterfall.
///
/// Labels: `source`, `status` ("ok" | "error").
pub const LOOKUPS_TOTAL: &str = "cedula_lookups_total";

/// Lookup duration in seconds, including upstream calls.
pub const LOOKUP_DURATION_SECONDS: &str = "cedula_lookup_duration_seconds";

/// Cache entries served.
///
/// Labels: `tier` ("fresh" | "refresh_zone" | "stale").
pub const CACHE_HITS_TOTAL: &str = "cedula_cache_hits_total";

/// Lookups that found no servable cache entry.
pub const CACHE_MISSES_TOTAL: &str = "cedula_cache_misses_total";

/// Requests sent to an upstream registry.
///
/// Labels: `provider`, `operation`, `status`.
pub const UPSTREAM_REQUESTS_TOTAL: &str = "cedula_upstream_requests_total";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `provider`, `operation`.
pub const RETRIES_TOTAL: &str = "cedula_retries_total";

/// Token acquisitions refused by the local rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "cedula_rate_limited_total";

/// Items processed by maintenance jobs.
///
/// Labels: `job`, `status` ("refreshed" | "failed" | "purged").
pub const JOB_ITEMS_TOTAL: &str = "cedula_job_items_total";

/// Failure-rate alerts raised by maintenance jobs.
///
/// Labels: `job`.
pub const JOB_ALERTS_TOTAL: &str = "cedula_job_alerts_total";
