//! Tax identification numbers and tenant scoping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CedulaError, Result};

/// Shortest accepted tax id (persona física).
const MIN_DIGITS: usize = 9;
/// Longest accepted tax id (DIMEX).
const MAX_DIGITS: usize = 12;

/// A syntactically valid Costa Rican tax identification number.
///
/// Construction strips `-` and spaces (`3-101-123456` → `3101123456`) and
/// then requires 9 to 12 ASCII digits. A `TaxId` value therefore never
/// needs re-validation downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
    /// Normalize and validate raw user input.
    pub fn parse(input: &str) -> Result<Self> {
        let cleaned: String = input
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != ' ')
            .collect();

        let valid = (MIN_DIGITS..=MAX_DIGITS).contains(&cleaned.len())
            && cleaned.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(CedulaError::InvalidTaxId(input.to_string()));
        }
        Ok(Self(cleaned))
    }

    /// The normalized digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identification kind implied by length and prefix.
    pub fn kind(&self) -> IdKind {
        IdKind::classify(&self.0)
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaxId {
    type Err = CedulaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaxId {
    type Error = CedulaError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<TaxId> for String {
    fn from(id: TaxId) -> Self {
        id.0
    }
}

/// Registry identification kind, with its two-digit wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// Persona física (9 digits).
    Fisica,
    /// Persona jurídica (10 digits, leading `3`).
    Juridica,
    /// DIMEX residence document (11 or 12 digits).
    Dimex,
    /// NITE (10 digits, any other prefix).
    Nite,
    /// Foreign identification.
    Extranjero,
}

impl IdKind {
    /// Classify a digit string by length and leading digit.
    pub fn classify(digits: &str) -> Self {
        match digits.len() {
            9 => IdKind::Fisica,
            10 if digits.starts_with('3') => IdKind::Juridica,
            10 => IdKind::Nite,
            11 | 12 => IdKind::Dimex,
            _ => IdKind::Extranjero,
        }
    }

    /// Two-digit code used by the registry (`tipoIdentificacion`).
    pub fn code(&self) -> &'static str {
        match self {
            IdKind::Fisica => "01",
            IdKind::Juridica => "02",
            IdKind::Dimex => "03",
            IdKind::Nite => "04",
            IdKind::Extranjero => "05",
        }
    }
}

/// Opaque tenant (company) identifier scoping cache entries and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
