//! Public types for the Cedula API.

mod tax_id;
mod taxpayer;
mod verification;

pub use tax_id::{IdKind, TaxId, TenantId};
pub use taxpayer::{CompanyKind, EconomicActivity, TaxStatus, TaxpayerRecord};
pub use verification::QuickVerification;
