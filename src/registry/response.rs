//! HTTP status mapping and payload normalization shared by the registry
//! clients.

use std::time::Duration;

use reqwest::Response;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::types::{CompanyKind, EconomicActivity, TaxId, TaxStatus, TaxpayerRecord};
use crate::{CedulaError, Result};

/// Longest error text carried into an error message.
const MAX_ERROR_TEXT: usize = 500;

/// Fields that may carry a human-readable error, in lookup order.
const ERROR_FIELDS: &[&str] = &[
    "message",
    "error",
    "mensaje",
    "detalle-mensaje",
    "descripcion",
    "errorMessage",
];

/// Check response status and map to the appropriate error.
///
/// `subject` names what was requested (tax id or document key) and ends
/// up in [`CedulaError::NotFound`].
pub(crate) async fn error_for_status(response: Response, subject: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    match code {
        404 => Err(CedulaError::NotFound {
            tax_id: subject.to_string(),
        }),
        429 => Err(CedulaError::RateLimited {
            retry_after: retry_after_hint(response.headers()),
        }),
        _ => {
            let cause = response
                .headers()
                .get("x-error-cause")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let mut message = extract_error_message(&body, code);
            if let Some(cause) = cause.filter(|c| !c.is_empty()) {
                message = format!("{message} (cause: {cause})");
            }

            match code {
                401 => Err(CedulaError::AuthenticationFailed(message)),
                c if c >= 500 => Err(CedulaError::Api { status: c, message }),
                c => Err(CedulaError::Validation { status: c, message }),
            }
        }
    }
}

/// Wait hint from `Retry-After` or `X-Ratelimit-Reset` (both in seconds).
pub(crate) fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset"].iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs.max(1)))
    })
}

/// Pull a readable message out of an error body.
///
/// Tries the common error fields, then an `errors` list, then the whole
/// JSON value; a non-JSON body is returned as (truncated) text.
pub(crate) fn extract_error_message(body: &str, status: u16) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        let text = body.trim();
        return if text.is_empty() {
            format!("HTTP {status}")
        } else {
            truncate(text, MAX_ERROR_TEXT)
        };
    };

    for field in ERROR_FIELDS {
        match value.get(*field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(serde_json::Value::Null) | None => {}
            Some(serde_json::Value::String(_)) => {}
            Some(other) => return other.to_string(),
        }
    }

    if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
        return errors
            .iter()
            .map(|e| match e {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
    }

    truncate(&value.to_string(), MAX_ERROR_TEXT)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ============================================================================
// Taxpayer payload
// ============================================================================

#[derive(Debug, Deserialize)]
struct TaxpayerPayload {
    #[serde(default)]
    nombre: Option<String>,
    #[serde(default)]
    regimen: Option<serde_json::Value>,
    #[serde(default)]
    situacion: Option<Situacion>,
    #[serde(default)]
    actividades: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Situacion {
    #[serde(default)]
    estado: Option<String>,
}

/// Normalize a registry/mirror JSON body into a [`TaxpayerRecord`].
///
/// The body must be a JSON object. Missing optional fields degrade to
/// empty values; activity entries that are not objects are skipped.
pub(crate) fn parse_taxpayer(tax_id: &TaxId, body: &str) -> Result<TaxpayerRecord> {
    let raw: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| CedulaError::MalformedResponse(format!("invalid JSON for {tax_id}: {e}")))?;
    if !raw.is_object() {
        return Err(CedulaError::MalformedResponse(format!(
            "expected a JSON object for {tax_id}"
        )));
    }
    let payload: TaxpayerPayload = serde_json::from_value(raw.clone())
        .map_err(|e| CedulaError::MalformedResponse(format!("unexpected shape for {tax_id}: {e}")))?;

    let tax_regime = match &payload.regimen {
        Some(serde_json::Value::Object(m)) => m
            .get("descripcion")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    let economic_activities: Vec<EconomicActivity> = payload
        .actividades
        .as_ref()
        .and_then(|a| a.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|act| act.as_object())
                .map(|act| {
                    let field = |k: &str| {
                        act.get(k)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string()
                    };
                    EconomicActivity {
                        code: field("codigo"),
                        description: field("descripcion"),
                        is_primary: matches!(
                            field("tipo").trim().to_lowercase().as_str(),
                            "p" | "principal"
                        ),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let tax_status = payload
        .situacion
        .and_then(|s| s.estado)
        .filter(|e| !e.trim().is_empty())
        .map(|e| TaxStatus::from_registry(&e))
        .unwrap_or(TaxStatus::Inscrito);

    Ok(TaxpayerRecord {
        tax_id: tax_id.clone(),
        name: payload.nombre.unwrap_or_default().trim().to_string(),
        company_kind: CompanyKind::from_regime(&tax_regime),
        tax_regime,
        tax_status,
        primary_activity: TaxpayerRecord::primary_of(&economic_activities),
        economic_activities,
        raw_response: Some(raw),
    })
}
