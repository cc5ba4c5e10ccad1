//! Secondary lookup source: a public mirror of the Hacienda registry
//! (GoMeta), consulted when the registry itself is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::RegistryProvider;
use super::response::{error_for_status, parse_taxpayer};
use crate::telemetry;
use crate::types::{TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, Result};

/// Default base URL of the mirror API.
pub const DEFAULT_MIRROR_URL: &str = "https://apis.gometa.org";

/// The mirror answers from its own short-lived cache; keep the timeout short.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const PROVIDER: &str = "mirror";

/// Client for the mirror's `/cedulas/{id}` endpoint. No authentication.
#[derive(Clone)]
pub struct MirrorClient {
    http: Client,
    base_url: String,
}

impl MirrorClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_MIRROR_URL)
    }

    /// Create a client with a custom base URL (for testing with wiremock).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::with_options(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_options(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MirrorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryProvider for MirrorClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn lookup(&self, tenant: &TenantId, tax_id: &TaxId) -> Result<TaxpayerRecord> {
        let url = format!("{}/cedulas/{}", self.base_url, tax_id);
        debug!(tax_id = %tax_id, tenant = %tenant, "querying mirror");

        let response = self.http.get(&url).send().await.map_err(|e| {
            record_request(false);
            CedulaError::from(e)
        })?;
        record_request(response.status().is_success());

        let response = error_for_status(response, tax_id.as_str()).await?;
        let body = response.text().await?;
        parse_taxpayer(tax_id, &body)
    }
}

fn record_request(ok: bool) {
    metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL,
        "provider" => PROVIDER,
        "operation" => "lookup",
        "status" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}
