//! Cedula error types

use std::time::Duration;

/// Coarse classification of a [`CedulaError`].
///
/// Used where an error has to be reported as data rather than propagated
/// (batch lookup results, maintenance job reports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    UpstreamTransient,
    NotFound,
    ManualEntry,
    Internal,
}

/// Cedula error types
#[derive(Debug, thiserror::Error)]
pub enum CedulaError {
    // Input errors
    #[error("invalid tax id '{0}': expected 9 to 12 digits")]
    InvalidTaxId(String),

    #[error("invalid document key '{0}': expected 50 digits")]
    InvalidDocumentKey(String),

    #[error("request rejected by registry ({status}): {message}")]
    Validation { status: u16, message: String },

    // Authentication / configuration
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Local backpressure
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    // Upstream transient errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited by upstream, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CedulaError>,
    },

    // Registry answers
    #[error("tax id {tax_id} not found in registry")]
    NotFound { tax_id: String },

    #[error("malformed registry response: {0}")]
    MalformedResponse(String),

    /// Every automated source is exhausted. Terminal.
    #[error(
        "could not verify tax id {tax_id} ({reason}); enter the taxpayer data manually and mark the document as unverified"
    )]
    ManualEntryRequired { tax_id: String, reason: String },

    // Storage / data errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CedulaError {
    /// Whether the error is worth retrying against the same upstream.
    ///
    /// Connection failures, timeouts, 5xx and upstream 429 are transient.
    /// Everything else (validation, auth, not-found, local rate limiting,
    /// exhausted retries) is permanent for the current operation.
    pub fn is_transient(&self) -> bool {
        match self {
            CedulaError::Http(_) | CedulaError::Timeout(_) | CedulaError::RateLimited { .. } => {
                true
            }
            CedulaError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Upstream-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CedulaError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify the error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CedulaError::InvalidTaxId(_)
            | CedulaError::InvalidDocumentKey(_)
            | CedulaError::Validation { .. } => ErrorKind::Validation,
            CedulaError::AuthenticationFailed(_) | CedulaError::Configuration(_) => ErrorKind::Auth,
            CedulaError::RateLimitExceeded(_) => ErrorKind::RateLimit,
            CedulaError::Http(_)
            | CedulaError::Timeout(_)
            | CedulaError::Api { .. }
            | CedulaError::RateLimited { .. }
            | CedulaError::RetriesExhausted { .. } => ErrorKind::UpstreamTransient,
            CedulaError::NotFound { .. } => ErrorKind::NotFound,
            CedulaError::ManualEntryRequired { .. } => ErrorKind::ManualEntry,
            CedulaError::MalformedResponse(_)
            | CedulaError::Storage(_)
            | CedulaError::Json(_) => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for CedulaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CedulaError::Timeout(err.to_string())
        } else if err.is_decode() {
            CedulaError::MalformedResponse(err.to_string())
        } else {
            CedulaError::Http(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for CedulaError {
    fn from(err: rusqlite::Error) -> Self {
        CedulaError::Storage(err.to_string())
    }
}

/// Result type alias for Cedula operations
pub type Result<T> = std::result::Result<T, CedulaError>;
