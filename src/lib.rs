//! Cedula - Costa Rica tax-id resolution with a tiered cache
//!
//! This crate resolves a cédula (tax id) to the taxpayer data held by the
//! Ministerio de Hacienda registry, shielding callers from registry outages
//! and rate limits:
//!
//! - a shared token-bucket [`RateLimiter`] caps outbound registry calls;
//! - a tenant-scoped [`CacheStore`] serves answers by age tier;
//! - [`LookupService`] runs the waterfall cache → registry → mirror →
//!   stale cache → manual entry;
//! - [`MaintenanceScheduler`] refreshes and purges the cache out of band.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cedula::{
//!     CacheStore, HaciendaClient, LookupService, MirrorClient, RateLimitConfig, RateLimiter,
//!     RegistryProvider, RetryConfig, RetryingRegistry, SystemClock, TenantId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> cedula::Result<()> {
//!     let clock = Arc::new(SystemClock);
//!     let cache = CacheStore::in_memory(clock.clone());
//!     let limiter = RateLimiter::in_memory(clock, RateLimitConfig::default());
//!
//!     let hacienda: Arc<dyn RegistryProvider> = Arc::new(HaciendaClient::new(Default::default()));
//!     let registry = Arc::new(RetryingRegistry::new(hacienda, RetryConfig::default()));
//!     let mirror: Arc<dyn RegistryProvider> = Arc::new(MirrorClient::new());
//!     let service = LookupService::new(cache, limiter, registry, Some(mirror));
//!
//!     let result = service.lookup("3-101-123456", &TenantId::from("acme"), false).await?;
//!     println!("{} ({})", result.data.name, result.source.as_str());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod lookup;
pub mod maintenance;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use cache::{
    CacheEntry, CacheKey, CachePolicy, CacheStatistics, CacheStore, CacheTier, EntrySource,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, Secrets};
pub use error::{CedulaError, ErrorKind, Result};
pub use limiter::{BucketSnapshot, BucketState, RateLimitConfig, RateLimiter};
pub use lookup::{
    BatchLookup, BatchOutcome, BatchSummary, LookupResult, LookupService, ResultSource,
    ServiceHealth,
};
pub use maintenance::{
    AlertSink, JobError, JobKind, JobReport, MaintenanceScheduler, TracingAlertSink,
};
pub use registry::{
    CredentialMap, DocumentStatus, DocumentSubmission, Environment, HaciendaClient, HaciendaUrls,
    MirrorClient, RegistryProvider, RegistrySettings, RetryConfig, RetrySettings,
    RetryingRegistry, TenantCredentials,
};
pub use store::{MemoryStore, RowStore, SqliteStore, StorageSettings};
pub use types::{
    CompanyKind, EconomicActivity, IdKind, QuickVerification, TaxId, TaxStatus, TaxpayerRecord,
    TenantId,
};

/// Crate version.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
