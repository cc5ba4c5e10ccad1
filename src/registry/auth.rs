//! OAuth2 tokens for the privileged Hacienda endpoints.
//!
//! One token set per tenant, cached until `expires_in - 30s`. An expired
//! access token with a still-valid refresh token triggers a
//! `refresh_token` grant first; if that fails, a full password grant.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use super::response::extract_error_message;
use crate::telemetry;
use crate::types::TenantId;
use crate::{CedulaError, Result};

/// Token lifetime assumed when the IdP omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 300;
/// Refresh-token lifetime assumed when the IdP omits `refresh_expires_in`.
const DEFAULT_REFRESH_EXPIRES_IN: u64 = 1800;
/// Tokens are treated as expired this long before the IdP says so.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Hacienda deployment a tenant talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    /// OAuth2 client id registered for this environment.
    pub fn client_id(&self) -> &'static str {
        match self {
            Environment::Sandbox => "api-stag",
            Environment::Production => "api-prod",
        }
    }
}

/// Per-tenant registry credentials.
#[derive(Clone, Deserialize)]
pub struct TenantCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub environment: Environment,
}

impl fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("environment", &self.environment)
            .finish()
    }
}

/// Credentials for every tenant, keyed by tenant id.
pub type CredentialMap = HashMap<TenantId, TenantCredentials>;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Instant,
    refresh_expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_cached(self, now: Instant) -> CachedToken {
        let lifetime = |secs: u64| Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN);
        CachedToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at: now + lifetime(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
            refresh_expires_at: now
                + lifetime(self.refresh_expires_in.unwrap_or(DEFAULT_REFRESH_EXPIRES_IN)),
        }
    }
}

/// Obtains and caches bearer tokens per tenant.
pub(crate) struct TokenManager {
    http: Client,
    credentials: Arc<CredentialMap>,
    idp_urls: HashMap<Environment, String>,
    tokens: Cache<TenantId, CachedToken>,
}

impl TokenManager {
    pub(crate) fn new(
        http: Client,
        credentials: Arc<CredentialMap>,
        idp_urls: HashMap<Environment, String>,
    ) -> Self {
        Self {
            http,
            credentials,
            idp_urls,
            tokens: Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// A valid access token for `tenant`.
    ///
    /// Fails fast with [`CedulaError::Configuration`] when the tenant has no
    /// credentials and with [`CedulaError::AuthenticationFailed`] when the
    /// IdP rejects them. Timeouts and connection errors surface as
    /// [`CedulaError::Timeout`] / [`CedulaError::Http`] for the caller's
    /// retry loop.
    pub(crate) async fn token(&self, tenant: &TenantId) -> Result<String> {
        let creds = self.credentials.get(tenant).ok_or_else(|| {
            CedulaError::Configuration(format!("no registry credentials for tenant '{tenant}'"))
        })?;

        let now = Instant::now();
        if let Some(cached) = self.tokens.get(tenant).await {
            if cached.expires_at > now {
                return Ok(cached.access_token);
            }
            let refresh = cached
                .refresh_token
                .as_deref()
                .filter(|_| cached.refresh_expires_at > now);
            if let Some(refresh) = refresh {
                match self.refresh_grant(tenant, creds, refresh).await {
                    Ok(token) => return Ok(token),
                    Err(e) => {
                        info!(tenant = %tenant, error = %e, "refresh grant failed, falling back to password grant");
                        self.tokens.invalidate(tenant).await;
                    }
                }
            }
        }

        self.password_grant(tenant, creds).await
    }

    /// Drop the cached token for `tenant`.
    pub(crate) async fn invalidate(&self, tenant: &TenantId) {
        self.tokens.invalidate(tenant).await;
    }

    fn idp_url(&self, env: Environment) -> Result<&str> {
        self.idp_urls
            .get(&env)
            .map(String::as_str)
            .ok_or_else(|| CedulaError::Configuration(format!("no identity provider URL for {env:?}")))
    }

    async fn password_grant(&self, tenant: &TenantId, creds: &TenantCredentials) -> Result<String> {
        let form = [
            ("grant_type", "password"),
            ("client_id", creds.environment.client_id()),
            ("username", creds.username.as_str()),
            ("password", creds.password.as_str()),
        ];
        self.request_token(tenant, creds.environment, &form, "password").await
    }

    async fn refresh_grant(
        &self,
        tenant: &TenantId,
        creds: &TenantCredentials,
        refresh_token: &str,
    ) -> Result<String> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", creds.environment.client_id()),
            ("refresh_token", refresh_token),
        ];
        self.request_token(tenant, creds.environment, &form, "refresh_token")
            .await
    }

    async fn request_token(
        &self,
        tenant: &TenantId,
        env: Environment,
        form: &[(&str, &str)],
        grant: &str,
    ) -> Result<String> {
        let url = self.idp_url(env)?;
        let response = self.http.post(url).form(form).send().await.map_err(|e| {
            metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL,
                "provider" => "hacienda", "operation" => "token", "status" => "error")
            .increment(1);
            CedulaError::from(e)
        })?;

        let status = response.status();
        metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL,
            "provider" => "hacienda",
            "operation" => "token",
            "status" => if status.is_success() { "ok" } else { "error" },
        )
        .increment(1);

        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("error_description")
                        .and_then(|d| d.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| extract_error_message(&body, code));
            return Err(match code {
                401 => CedulaError::AuthenticationFailed(format!(
                    "invalid username or password for tenant '{tenant}'"
                )),
                c if c >= 500 => CedulaError::Api {
                    status: c,
                    message: format!("identity provider error: {detail}"),
                },
                c => CedulaError::AuthenticationFailed(format!(
                    "identity provider rejected {grant} grant (HTTP {c}): {detail}"
                )),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            CedulaError::MalformedResponse(format!("invalid token response: {e}"))
        })?;
        let cached = body.into_cached(Instant::now());
        let token = cached.access_token.clone();
        self.tokens.insert(tenant.clone(), cached).await;
        debug!(tenant = %tenant, grant, "obtained registry access token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids() {
        assert_eq!(Environment::Sandbox.client_id(), "api-stag");
        assert_eq!(Environment::Production.client_id(), "api-prod");
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = TenantCredentials {
            username: "cpj-3-101-123456@stag.comprobanteselectronicos.go.cr".into(),
            password: "hunter2".into(),
            environment: Environment::Sandbox,
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn token_lifetimes_apply_margin() {
        let now = Instant::now();
        let cached = TokenResponse {
            access_token: "a".into(),
            refresh_token: Some(String::new()),
            expires_in: Some(300),
            refresh_expires_in: None,
        }
        .into_cached(now);
        assert_eq!(cached.expires_at - now, Duration::from_secs(270));
        assert_eq!(cached.refresh_expires_at - now, Duration::from_secs(1770));
        assert!(cached.refresh_token.is_none());
    }
}
