//! Resolved taxpayer data.

use serde::{Deserialize, Serialize};

use super::TaxId;

/// Registration status of a taxpayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaxStatus {
    /// Registered and active.
    Inscrito,
    /// Known to the registry but not currently registered.
    Inactivo,
    /// The registry confirmed there is no such taxpayer.
    NoEncontrado,
    /// The last resolution attempt failed.
    Error,
}

impl TaxStatus {
    /// Map the registry's `situacion.estado` text.
    ///
    /// `"Inscrito"` and `"Inscrito de oficio"` are active; any other
    /// non-empty state is inactive.
    pub fn from_registry(estado: &str) -> Self {
        if estado.trim().to_lowercase().starts_with("inscrito") {
            TaxStatus::Inscrito
        } else {
            TaxStatus::Inactivo
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxStatus::Inscrito => "inscrito",
            TaxStatus::Inactivo => "inactivo",
            TaxStatus::NoEncontrado => "no_encontrado",
            TaxStatus::Error => "error",
        }
    }
}

/// Legal form of a taxpayer, inferred from its tax regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyKind {
    Person,
    Company,
    Cooperative,
    Trust,
    Nonprofit,
    #[default]
    Other,
}

impl CompanyKind {
    /// Infer the legal form from a tax-regime description.
    pub fn from_regime(regime: &str) -> Self {
        let regime = regime.to_lowercase();
        if regime.contains("física") || regime.contains("fisica") || regime.contains("freelance")
        {
            CompanyKind::Person
        } else if regime.contains("sociedad") || regime.contains("s.a.") {
            CompanyKind::Company
        } else if regime.contains("cooperativa") {
            CompanyKind::Cooperative
        } else if regime.contains("fideicomiso") {
            CompanyKind::Trust
        } else if regime.contains("asociación")
            || regime.contains("asociacion")
            || regime.contains("fundación")
            || regime.contains("fundacion")
        {
            CompanyKind::Nonprofit
        } else {
            CompanyKind::Other
        }
    }
}

/// One CIIU economic activity registered for a taxpayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomicActivity {
    pub code: String,
    pub description: String,
    pub is_primary: bool,
}

/// Normalized result of a registry or mirror lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxpayerRecord {
    pub tax_id: TaxId,
    pub name: String,
    pub company_kind: CompanyKind,
    pub tax_regime: String,
    pub tax_status: TaxStatus,
    pub economic_activities: Vec<EconomicActivity>,
    /// Code of the primary activity (the one flagged `principal`, else the first).
    pub primary_activity: Option<String>,
    /// Upstream payload as received, kept for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

impl TaxpayerRecord {
    /// Marker stored when the registry confirms the tax id does not exist.
    pub fn not_found(tax_id: TaxId) -> Self {
        Self {
            tax_id,
            name: String::new(),
            company_kind: CompanyKind::Other,
            tax_regime: String::new(),
            tax_status: TaxStatus::NoEncontrado,
            economic_activities: Vec::new(),
            primary_activity: None,
            raw_response: None,
        }
    }

    /// Pick the primary activity code from a list of activities.
    pub(crate) fn primary_of(activities: &[EconomicActivity]) -> Option<String> {
        activities
            .iter()
            .find(|a| a.is_primary)
            .or_else(|| activities.first())
            .map(|a| a.code.clone())
    }
}
