//! Certificate request construction
//!
//! A [`LeafProfile`] is the signing request for an end-entity certificate:
//! subject, SANs, usages and validity window. It becomes rcgen
//! `CertificateParams` once a key has been chosen.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
    SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};

use super::crypto::{KeyKind, KeyMaterial};
use crate::error::{PqcertError, Result};

/// Classify a SAN literal as an IP address or a DNS name
///
/// Anything `IpAddr` parses is an IP entry; everything else must be a valid
/// IA5 DNS name (wildcards allowed).
pub fn classify_san(name: &str) -> Result<SanType> {
    if let Ok(ip) = IpAddr::from_str(name) {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = Ia5String::try_from(name)
        .map_err(|e| PqcertError::crypto("build csr", format!("invalid SAN '{}': {}", name, e)))?;
    Ok(SanType::DnsName(dns))
}

/// Current time truncated to whole seconds, the resolution of X.509 times
pub fn now_seconds() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond()))
}

/// Convert an X.509 time to chrono
pub fn to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(t.unix_timestamp(), 0).unwrap_or_default()
}

/// Random positive 128-bit serial number
pub fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Positive, and a full 16 bytes so the encoding never shrinks
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

/// Subject and extensions for an end-entity certificate
#[derive(Debug, Clone)]
pub struct LeafProfile {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub subject_alt_names: Vec<String>,
    pub validity_days: u32,
}

impl LeafProfile {
    /// Profile for a domain-validated leaf: SAN is exactly the domain
    pub fn for_domain(domain: &str, validity_days: u32) -> Self {
        Self {
            common_name: domain.to_string(),
            organization: None,
            organizational_unit: None,
            subject_alt_names: vec![domain.to_string()],
            validity_days,
        }
    }

    /// Build signing parameters for a key of `kind`
    ///
    /// RSA keys get `digitalSignature, keyEncipherment`; signature-only keys
    /// such as ML-DSA cannot encipher and get `digitalSignature` alone.
    pub fn to_params(
        &self,
        kind: KeyKind,
        serial: SerialNumber,
        not_before: OffsetDateTime,
    ) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(ou) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        dn.push(DnType::CommonName, self.common_name.as_str());
        params.distinguished_name = dn;

        params.subject_alt_names = self
            .subject_alt_names
            .iter()
            .map(|name| classify_san(name))
            .collect::<Result<_>>()?;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = if kind.is_rsa() {
            vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ]
        } else {
            vec![KeyUsagePurpose::DigitalSignature]
        };
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        params.serial_number = Some(serial);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(self.validity_days));

        Ok(params)
    }

    /// PKCS#10 request for this profile, PEM encoded
    pub fn csr_pem(&self, key: &KeyMaterial) -> Result<String> {
        let params = self.to_params(key.kind(), random_serial(), now_seconds())?;
        params
            .serialize_request(key.key_pair())
            .and_then(|csr| csr.pem())
            .map_err(|e| PqcertError::crypto("build csr", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_classify_san() {
        assert!(matches!(
            classify_san("127.0.0.1").unwrap(),
            SanType::IpAddress(IpAddr::V4(ip)) if ip == Ipv4Addr::LOCALHOST
        ));
        assert!(matches!(
            classify_san("::1").unwrap(),
            SanType::IpAddress(IpAddr::V6(ip)) if ip == Ipv6Addr::LOCALHOST
        ));
        assert!(matches!(classify_san("localhost").unwrap(), SanType::DnsName(_)));
        assert!(matches!(classify_san("*.localhost").unwrap(), SanType::DnsName(_)));
        // Hex-only labels are DNS names, not IPv6 fragments
        assert!(matches!(classify_san("beef.cafe").unwrap(), SanType::DnsName(_)));
        assert!(matches!(classify_san("1234").unwrap(), SanType::DnsName(_)));
        assert!(classify_san("bad\u{e9}name").is_err());
    }

    #[test]
    fn test_random_serial_positive_and_distinct() {
        let a = random_serial();
        let b = random_serial();
        assert_ne!(a, b);
        let bytes = a.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0] & 0x80, 0);
    }

    #[test]
    fn test_params_validity_window() {
        let profile = LeafProfile::for_domain("example.com", 90);
        let start = now_seconds();
        let params = profile
            .to_params(KeyKind::Rsa2048, random_serial(), start)
            .unwrap();
        assert_eq!(params.not_after - params.not_before, Duration::days(90));
        assert_eq!(params.not_before.nanosecond(), 0);
    }

    #[test]
    fn test_ml_dsa_profile_has_no_key_encipherment() {
        let profile = LeafProfile::for_domain("example.com", 90);
        let params = profile
            .to_params(KeyKind::MlDsa65, random_serial(), now_seconds())
            .unwrap();
        assert_eq!(params.key_usages, vec![KeyUsagePurpose::DigitalSignature]);
    }

    #[test]
    fn test_csr_pem() {
        let key = KeyMaterial::generate(KeyKind::Rsa2048).unwrap();
        let pem = LeafProfile::for_domain("example.com", 90)
            .csr_pem(&key)
            .unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }
}
