//! Upstream registries.
//!
//! Every source of taxpayer data implements [`RegistryProvider`]:
//!
//! - [`HaciendaClient`] — the authoritative government registry. Also
//!   carries the OAuth2-authenticated document reception calls.
//! - [`MirrorClient`] — best-effort public mirror used as fallback.
//! - [`RetryingRegistry`] — decorator adding exponential-backoff retry on
//!   transient errors around any provider.
//!
//! Lookups answer with a normalized [`TaxpayerRecord`] or a
//! [`CedulaError`](crate::CedulaError) whose variant classifies the
//! failure (validation, auth, not-found, transient).

mod auth;
mod hacienda;
mod mirror;
mod response;
pub mod retry;
mod status;

pub use auth::{CredentialMap, Environment, TenantCredentials};
pub use hacienda::{DocumentSubmission, HaciendaClient, HaciendaUrls};
pub use mirror::{DEFAULT_MIRROR_URL, MirrorClient};
pub use retry::{RetryConfig, RetrySettings, RetryingRegistry};
pub use status::DocumentStatus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{TaxId, TaxpayerRecord, TenantId};

/// A source of taxpayer data.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    /// Provider name for logging and metrics.
    fn name(&self) -> &str;

    /// Resolve one tax id. A single logical call; retry, if any, is the
    /// job of a decorator.
    async fn lookup(&self, tenant: &TenantId, tax_id: &TaxId) -> Result<TaxpayerRecord>;
}

/// `[registry]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Per-request timeout for registry calls. Default: 30.
    pub timeout_secs: u64,
    /// Mirror base URL. Default: GoMeta.
    pub mirror_url: String,
    pub retry: RetrySettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            mirror_url: DEFAULT_MIRROR_URL.to_string(),
            retry: RetrySettings::default(),
        }
    }
}
