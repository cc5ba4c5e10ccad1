//! Retry configuration, delay calculation, and the registry decorator.
//!
//! [`with_retry`] is the single place retry logic lives: the
//! [`RetryingRegistry`] decorator uses it for lookups and
//! [`HaciendaClient`](super::HaciendaClient) uses it for document calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RegistryProvider;
use crate::telemetry;
use crate::types::{TaxId, TaxpayerRecord, TenantId};
use crate::{CedulaError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// Exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
///
/// ```rust
/// # use cedula::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 2s.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay after the given attempt (0-indexed), without upstream hints.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Delay after the given attempt, letting an upstream `Retry-After` /
    /// `X-Ratelimit-Reset` hint take precedence. The hint is still capped
    /// at `max_delay`.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// `[registry.retry]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_attempts: d.max_attempts,
            initial_delay_ms: d.initial_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig::new()
            .max_attempts(s.max_attempts)
            .initial_delay(Duration::from_millis(s.initial_delay_ms))
            .max_delay(Duration::from_millis(s.max_delay_ms))
    }
}

// ============================================================================
// Shared retry helper
// ============================================================================

/// Execute an async operation with retry logic.
///
/// Retries transient errors (see [`CedulaError::is_transient`]) up to
/// `config.max_attempts`, sleeping between attempts but never after the
/// last one. Permanent errors are returned immediately. Exhaustion yields
/// [`CedulaError::RetriesExhausted`] naming the attempt count.
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    provider_name: &str,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if attempt + 1 < max_attempts {
                    metrics::counter!(telemetry::RETRIES_TOTAL,
                        "provider" => provider_name.to_owned(),
                        "operation" => operation.to_owned(),
                    )
                    .increment(1);
                    let delay = config.effective_delay(attempt, e.retry_after());
                    warn!(
                        provider = provider_name,
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => {
                debug!(provider = provider_name, operation, error = %e, "permanent error, not retrying");
                return Err(e);
            }
        }
    }

    let last = last_err.unwrap_or_else(|| CedulaError::Http("no attempt was made".to_string()));
    Err(CedulaError::RetriesExhausted {
        attempts: max_attempts,
        last: Box::new(last),
    })
}

// ============================================================================
// RetryingRegistry
// ============================================================================

/// Decorator that wraps a [`RegistryProvider`] with retry logic.
///
/// Transient errors (connection, timeout, 5xx, upstream 429) are retried
/// with exponential backoff; validation, auth and not-found answers are
/// returned after a single attempt.
pub struct RetryingRegistry {
    inner: Arc<dyn RegistryProvider>,
    config: RetryConfig,
}

impl RetryingRegistry {
    pub fn new(inner: Arc<dyn RegistryProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl RegistryProvider for RetryingRegistry {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn lookup(&self, tenant: &TenantId, tax_id: &TaxId) -> Result<TaxpayerRecord> {
        with_retry(&self.config, self.inner.name(), "lookup", || {
            self.inner.lookup(tenant, tax_id)
        })
        .await
    }
}
