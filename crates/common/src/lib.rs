//! Shared identifiers and enums used across the PQCert crates.

pub mod ids;
pub mod types;

pub use ids::{CertificateId, ChallengeId, InvalidId};
pub use types::{Algorithm, ParseAlgorithmError, Platform};
