//! Hacienda (Ministerio de Hacienda) registry client.
//!
//! Two surfaces:
//! - the public taxpayer lookup (`/fe/ae?identificacion=`), no auth;
//! - the privileged document reception API (`/recepcion`), OAuth2 bearer
//!   token per tenant, environment-specific identity provider and base URL.
//!
//! See: <https://www.hacienda.go.cr/ATV/ComprobanteElectronico/frmAnexosyEstructuras.aspx>

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use super::RegistryProvider;
use super::auth::{CredentialMap, Environment, TokenManager};
use super::response::{error_for_status, parse_taxpayer};
use super::retry::{RetryConfig, with_retry};
use super::status::DocumentStatus;
use crate::telemetry;
use crate::types::{TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, Result};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Length of an electronic document key (clave).
const CLAVE_LEN: usize = 50;
/// Costa Rica's UTC offset, used for the submission timestamp.
const CR_UTC_OFFSET_SECS: i32 = -6 * 3600;

const PROVIDER: &str = "hacienda";

/// Endpoint set for the Hacienda client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaciendaUrls {
    /// Public taxpayer lookup endpoint.
    pub lookup: String,
    pub sandbox_idp: String,
    pub production_idp: String,
    /// Reception API base (`…/recepcion-sandbox/v1`).
    pub sandbox_recepcion: String,
    /// Reception API base (`…/recepcion/v1`).
    pub production_recepcion: String,
}

impl Default for HaciendaUrls {
    fn default() -> Self {
        Self {
            lookup: "https://api.hacienda.go.cr/fe/ae".to_string(),
            sandbox_idp: "https://idp.comprobanteselectronicos.go.cr/auth/realms/rut-stag/protocol/openid-connect/token".to_string(),
            production_idp: "https://idp.comprobanteselectronicos.go.cr/auth/realms/rut/protocol/openid-connect/token".to_string(),
            sandbox_recepcion: "https://api.comprobanteselectronicos.go.cr/recepcion-sandbox/v1".to_string(),
            production_recepcion: "https://api.comprobanteselectronicos.go.cr/recepcion/v1".to_string(),
        }
    }
}

impl HaciendaUrls {
    /// Every endpoint on one host (for testing with wiremock).
    ///
    /// Lookup at `{base}/fe/ae`, tokens at `{base}/token`, reception at
    /// `{base}/recepcion/v1`, for both environments.
    pub fn single_host(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            lookup: format!("{base}/fe/ae"),
            sandbox_idp: format!("{base}/token"),
            production_idp: format!("{base}/token"),
            sandbox_recepcion: format!("{base}/recepcion/v1"),
            production_recepcion: format!("{base}/recepcion/v1"),
        }
    }

    fn recepcion(&self, env: Environment) -> &str {
        match env {
            Environment::Sandbox => &self.sandbox_recepcion,
            Environment::Production => &self.production_recepcion,
        }
    }
}

/// An electronic document to submit for reception.
#[derive(Debug, Clone)]
pub struct DocumentSubmission {
    /// 50-digit document key.
    pub clave: String,
    pub fecha: DateTime<Utc>,
    pub emisor: TaxId,
    /// Absent for tickets (tiquete electrónico).
    pub receptor: Option<TaxId>,
    /// Signed XML document; sent base64-encoded.
    pub signed_xml: String,
}

/// Primary registry client.
pub struct HaciendaClient {
    http: Client,
    urls: HaciendaUrls,
    credentials: Arc<CredentialMap>,
    tokens: TokenManager,
    retry: RetryConfig,
}

impl HaciendaClient {
    /// Create a client against the production Hacienda endpoints.
    pub fn new(credentials: CredentialMap) -> Self {
        Self::with_urls(credentials, HaciendaUrls::default())
    }

    /// Create a client with custom endpoints (for testing with wiremock).
    pub fn with_urls(credentials: CredentialMap, urls: HaciendaUrls) -> Self {
        Self::with_options(credentials, urls, DEFAULT_TIMEOUT)
    }

    /// Create a client with custom endpoints and request timeout.
    pub fn with_options(credentials: CredentialMap, urls: HaciendaUrls, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        let credentials = Arc::new(credentials);
        let idp_urls = HashMap::from([
            (Environment::Sandbox, urls.sandbox_idp.clone()),
            (Environment::Production, urls.production_idp.clone()),
        ]);
        let tokens = TokenManager::new(http.clone(), credentials.clone(), idp_urls);

        Self {
            http,
            urls,
            credentials,
            tokens,
            retry: RetryConfig::default(),
        }
    }

    /// Retry policy for document calls. Lookups are retried by wrapping the
    /// client in [`RetryingRegistry`](super::RetryingRegistry).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Obtain (or reuse) a bearer token for `tenant`. Never retried here.
    pub async fn authenticate(&self, tenant: &TenantId) -> Result<String> {
        self.tokens.token(tenant).await
    }

    /// Submit a signed document for reception.
    pub async fn submit_document(
        &self,
        tenant: &TenantId,
        doc: &DocumentSubmission,
    ) -> Result<DocumentStatus> {
        validate_clave(&doc.clave)?;
        let url = format!("{}/recepcion", self.recepcion_base(tenant)?);

        let offset = FixedOffset::east_opt(CR_UTC_OFFSET_SECS)
            .ok_or_else(|| CedulaError::Configuration("invalid UTC offset".to_string()))?;
        let fecha = doc
            .fecha
            .with_timezone(&offset)
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string();

        let mut payload = serde_json::json!({
            "clave": doc.clave,
            "fecha": fecha,
            "emisor": {
                "tipoIdentificacion": doc.emisor.kind().code(),
                "numeroIdentificacion": doc.emisor.as_str(),
            },
            "comprobanteXml": STANDARD.encode(doc.signed_xml.as_bytes()),
        });
        if let Some(receptor) = &doc.receptor {
            payload["receptor"] = serde_json::json!({
                "tipoIdentificacion": receptor.kind().code(),
                "numeroIdentificacion": receptor.as_str(),
            });
        }

        let build = |token: &str| self.http.post(&url).bearer_auth(token).json(&payload);
        with_retry(&self.retry, PROVIDER, "submit", || {
            self.send_authenticated(tenant, &build, &doc.clave, "submit")
        })
        .await
    }

    /// Query the reception status of a document.
    pub async fn document_status(&self, tenant: &TenantId, clave: &str) -> Result<DocumentStatus> {
        validate_clave(clave)?;
        let url = format!("{}/recepcion/{clave}", self.recepcion_base(tenant)?);

        let build = |token: &str| self.http.get(&url).bearer_auth(token);
        with_retry(&self.retry, PROVIDER, "status", || {
            self.send_authenticated(tenant, &build, clave, "status")
        })
        .await
    }

    fn recepcion_base(&self, tenant: &TenantId) -> Result<&str> {
        let creds = self.credentials.get(tenant).ok_or_else(|| {
            CedulaError::Configuration(format!("no registry credentials for tenant '{tenant}'"))
        })?;
        Ok(self.urls.recepcion(creds.environment))
    }

    /// One authenticated request. A 401 from the API clears the cached
    /// token and re-authenticates once before failing.
    async fn send_authenticated<B>(
        &self,
        tenant: &TenantId,
        build: &B,
        subject: &str,
        operation: &'static str,
    ) -> Result<DocumentStatus>
    where
        B: Fn(&str) -> RequestBuilder,
    {
        let mut reauthenticated = false;
        loop {
            let token = self.tokens.token(tenant).await?;
            let response = build(&token).send().await.map_err(|e| {
                record_request(operation, false);
                CedulaError::from(e)
            })?;
            let status = response.status();
            record_request(operation, status.is_success());

            if status == StatusCode::UNAUTHORIZED {
                if reauthenticated {
                    return Err(CedulaError::AuthenticationFailed(format!(
                        "registry rejected a fresh token for tenant '{tenant}'; check the API credentials"
                    )));
                }
                warn!(tenant = %tenant, operation, "registry returned 401, re-authenticating");
                self.tokens.invalidate(tenant).await;
                reauthenticated = true;
                continue;
            }

            if let Some(remaining) = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|r| *r < 5)
            {
                warn!(remaining, operation, "registry rate limit running low");
            }

            let response = error_for_status(response, subject).await?;
            let body = response.text().await?;
            if status == StatusCode::ACCEPTED && body.trim().is_empty() {
                return Ok(DocumentStatus::received());
            }
            let parsed = DocumentStatus::parse(&body);
            debug!(operation, subject, estado = %parsed.estado, "registry document response");
            return Ok(parsed);
        }
    }
}

#[async_trait]
impl RegistryProvider for HaciendaClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn lookup(&self, tenant: &TenantId, tax_id: &TaxId) -> Result<TaxpayerRecord> {
        debug!(tax_id = %tax_id, tenant = %tenant, "querying registry");
        let response = self
            .http
            .get(&self.urls.lookup)
            .query(&[("identificacion", tax_id.as_str())])
            .send()
            .await
            .map_err(|e| {
                record_request("lookup", false);
                CedulaError::from(e)
            })?;
        record_request("lookup", response.status().is_success());

        let response = error_for_status(response, tax_id.as_str()).await?;
        let body = response.text().await?;
        parse_taxpayer(tax_id, &body)
    }
}

fn record_request(operation: &'static str, ok: bool) {
    metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL,
        "provider" => PROVIDER,
        "operation" => operation,
        "status" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}

fn validate_clave(clave: &str) -> Result<()> {
    if clave.len() == CLAVE_LEN && clave.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(CedulaError::InvalidDocumentKey(clave.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clave_validation() {
        assert!(validate_clave(&"5".repeat(50)).is_ok());
        assert!(validate_clave(&"5".repeat(49)).is_err());
        assert!(validate_clave(&format!("{}A", "5".repeat(49))).is_err());
    }

    #[test]
    fn single_host_urls() {
        let urls = HaciendaUrls::single_host("http://127.0.0.1:9999/");
        assert_eq!(urls.lookup, "http://127.0.0.1:9999/fe/ae");
        assert_eq!(urls.recepcion(Environment::Production), "http://127.0.0.1:9999/recepcion/v1");
        assert_eq!(urls.sandbox_idp, "http://127.0.0.1:9999/token");
    }

    #[test]
    fn default_urls_split_environments() {
        let urls = HaciendaUrls::default();
        assert!(urls.sandbox_idp.contains("rut-stag"));
        assert!(urls.production_idp.contains("/realms/rut/"));
        assert!(urls.recepcion(Environment::Sandbox).ends_with("recepcion-sandbox/v1"));
    }
}
