//! Certificate authority core
//!
//! Two issuance paths share the same crypto provider:
//!
//! - [`DomainIssuer`] signs self-signed leaves for domains that passed
//!   challenge validation (90 days, SAN exactly the domain).
//! - [`LocalAuthority`] owns a development root CA on disk and signs
//!   leaves for local hostnames that the OS trust store is made to accept.
//!
//! Issuance proceeds key generation → request ([`LeafProfile`]) → signing
//! → bundle assembly ([`CertificateBundle`]).

mod crypto;
mod domain;
pub mod hybrid;
mod local;
mod pkcs12;
mod profile;

use std::fmt;

use chrono::{DateTime, Utc};
use rcgen::SerialNumber;

use pqcert_common::Algorithm;

pub use crypto::{KeyKind, KeyMaterial};
pub use domain::DomainIssuer;
pub use local::{
    LocalAuthority, LocalLeaf, LocalLeafPaths, RootCertificate, CA_CERT_CRT_FILE, CA_CERT_FILE,
    CA_KEY_FILE, SERIAL_FILE, SERIAL_LOCK_FILE,
};
pub use pkcs12::build_pfx;
pub use profile::{classify_san, LeafProfile};

/// Issued leaf certificate with its key and chain
#[derive(Clone)]
pub struct CertificateBundle {
    pub algorithm: Algorithm,
    /// Leaf certificate only
    pub cert_pem: String,
    /// Leaf private key(s); for hybrid certificates RSA first, then ML-DSA
    pub key_pem: String,
    /// Issuer material; empty for self-signed leaves
    pub chain_pem: String,
    /// Leaf followed by chain
    pub fullchain_pem: String,
    pub cert_der: Vec<u8>,
    /// Hex serial number
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("algorithm", &self.algorithm)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

pub(crate) fn hex_serial(serial: &SerialNumber) -> String {
    serial
        .to_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
