//! cedula — tax-id lookup and cache maintenance from the command line.
//!
//! Runs the lookup waterfall or one maintenance job. With
//! `storage.database_path` set, the cache and the rate-limiter bucket live
//! in that SQLite file and are shared with every other process using it;
//! otherwise they stay in process memory, with the cache persisted between
//! runs when `cache.snapshot_path` is set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cedula::{
    CacheEntry, CacheKey, CacheStore, Clock, Config, HaciendaClient, HaciendaUrls, LookupService,
    MaintenanceScheduler, MemoryStore, MirrorClient, RateLimiter, RegistryProvider, RetryConfig,
    RetryingRegistry, Secrets, SystemClock, TenantId,
};

/// Costa Rica tax-id resolution with a tiered cache.
#[derive(Parser)]
#[command(name = "cedula")]
#[command(version = cedula::PKG_VERSION)]
#[command(about = "Resolve Costa Rica tax ids against the Hacienda registry")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve one or more tax ids.
    Lookup {
        #[arg(required = true)]
        tax_ids: Vec<String>,
        #[arg(short, long)]
        tenant: String,
        /// Skip the cache and go to the registry.
        #[arg(long)]
        force: bool,
    },
    /// Refresh entries in the refresh zone or stale tier.
    RefreshStale,
    /// Delete entries older than `cache.max_age_days`.
    PurgeExpired,
    /// Refresh heavily used entries regardless of tier.
    PriorityRefresh,
    /// Cache statistics and limiter state.
    Stats {
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Show (or reset) the rate-limiter bucket.
    Limiter {
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // An explicit --config must exist; otherwise fall back to defaults.
    let config = match args.config.as_deref() {
        Some(path) => Config::load(Some(path))?,
        None => Config::load(None).unwrap_or_else(|e| {
            warn!(error = %e, "using default configuration");
            Config::default()
        }),
    };
    let secrets = Secrets::load()?;

    let (cache, limiter, rows) = open_storage(&config)?;
    let service = build_service(&config, &secrets, cache, limiter);
    info!(version = cedula::PKG_VERSION, "cedula starting");

    match args.command {
        Command::Lookup {
            tax_ids,
            tenant,
            force,
        } => {
            let tenant = TenantId::new(tenant);
            if tax_ids.len() == 1 {
                match service.lookup(&tax_ids[0], &tenant, force).await {
                    Ok(result) => print_json(&result)?,
                    Err(e) => {
                        save_snapshot(&config, rows.as_deref());
                        return Err(e.into());
                    }
                }
            } else {
                let ids: Vec<&str> = tax_ids.iter().map(String::as_str).collect();
                print_json(&service.batch_lookup(&ids, &tenant).await)?;
            }
        }
        Command::RefreshStale => {
            let report = scheduler(&service, &config).refresh_stale_job().await;
            print_json(&report)?;
        }
        Command::PurgeExpired => {
            let report = scheduler(&service, &config).purge_expired_job().await;
            print_json(&report)?;
        }
        Command::PriorityRefresh => {
            let report = scheduler(&service, &config).priority_refresh_job().await;
            print_json(&report)?;
        }
        Command::Stats { tenant } => {
            let tenant = tenant.map(TenantId::new);
            print_json(&service.health(tenant.as_ref())?)?;
        }
        Command::Limiter { reset } => {
            if reset {
                service.limiter().reset()?;
            }
            print_json(&service.limiter().available_tokens()?)?;
        }
    }

    save_snapshot(&config, rows.as_deref());
    Ok(())
}

type MemoryRows = Arc<MemoryStore<CacheKey, CacheEntry>>;

/// Open the cache and limiter backends.
///
/// A configured database is shared with other processes and needs no
/// snapshot. Otherwise rows stay in memory and are returned so the caller
/// can save the snapshot on exit.
fn open_storage(config: &Config) -> cedula::Result<(CacheStore, RateLimiter, Option<MemoryRows>)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if let Some(path) = &config.storage.database_path {
        info!(path = %path.display(), "using shared sqlite storage");
        let cache = CacheStore::sqlite(path, clock.clone())?;
        let limiter = RateLimiter::sqlite(path, clock, config.rate_limit.clone())?;
        return Ok((cache, limiter, None));
    }

    let rows = Arc::new(MemoryStore::<CacheKey, CacheEntry>::new());
    if let Some(path) = &config.cache.snapshot_path {
        let loaded = rows.load_snapshot(path)?;
        info!(path = %path.display(), entries = loaded, "cache snapshot loaded");
    }
    let cache = CacheStore::new(rows.clone(), clock.clone());
    let limiter = RateLimiter::in_memory(clock, config.rate_limit.clone());
    Ok((cache, limiter, Some(rows)))
}

/// Wire the lookup service from configuration.
fn build_service(
    config: &Config,
    secrets: &Secrets,
    cache: CacheStore,
    limiter: RateLimiter,
) -> LookupService {
    let retry = RetryConfig::from(&config.registry.retry);

    let timeout = Duration::from_secs(config.registry.timeout_secs);
    let hacienda: Arc<dyn RegistryProvider> = Arc::new(HaciendaClient::with_options(
        secrets.credentials(),
        HaciendaUrls::default(),
        timeout,
    ));
    let registry: Arc<dyn RegistryProvider> =
        Arc::new(RetryingRegistry::new(hacienda, retry.clone()));
    let mirror: Arc<dyn RegistryProvider> =
        Arc::new(MirrorClient::with_base_url(&config.registry.mirror_url));
    let mirror: Arc<dyn RegistryProvider> = Arc::new(RetryingRegistry::new(mirror, retry));

    LookupService::new(cache, limiter, registry, Some(mirror))
}

fn scheduler(service: &LookupService, config: &Config) -> MaintenanceScheduler {
    MaintenanceScheduler::for_service(service, config.cache.clone())
}

fn save_snapshot(config: &Config, rows: Option<&MemoryStore<CacheKey, CacheEntry>>) {
    let Some(rows) = rows else {
        return;
    };
    if let Some(path) = &config.cache.snapshot_path {
        match rows.save_snapshot(path) {
            Ok(saved) => info!(path = %path.display(), entries = saved, "cache snapshot saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to save cache snapshot"),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
