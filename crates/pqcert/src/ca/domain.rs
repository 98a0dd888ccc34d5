//! Domain-validated issuance

use tracing::{debug, info};

use pqcert_common::Algorithm;
use pqcert_config::IssuanceConfig;

use super::crypto::{KeyKind, KeyMaterial};
use super::hybrid::sign_hybrid;
use super::profile::{now_seconds, random_serial, to_chrono, LeafProfile};
use super::{hex_serial, CertificateBundle};
use crate::challenge::validate_domain;
use crate::error::{PqcertError, Result};

/// Issues self-signed leaves for domains whose challenge has been verified
///
/// The trust value comes from the validation step, not from a chain, so the
/// chain is empty and `fullchain` equals the leaf.
#[derive(Debug, Clone)]
pub struct DomainIssuer {
    validity_days: u32,
}

impl DomainIssuer {
    pub fn new(config: &IssuanceConfig) -> Self {
        Self {
            validity_days: config.validity_days,
        }
    }

    pub fn validity_days(&self) -> u32 {
        self.validity_days
    }

    /// Generate a key for `algorithm` and sign a leaf for `domain`
    ///
    /// CPU-bound (RSA and ML-DSA key generation); call from a blocking
    /// context when running inside an async runtime.
    pub fn issue(&self, domain: &str, algorithm: Algorithm) -> Result<CertificateBundle> {
        validate_domain(domain)?;

        let profile = LeafProfile::for_domain(domain, self.validity_days);
        let serial = random_serial();
        let serial_hex = hex_serial(&serial);
        let not_before = now_seconds();

        debug!(domain = %domain, algorithm = %algorithm, serial = %serial_hex, "Signing leaf certificate");

        let (certificate, key_pem) = match algorithm {
            Algorithm::Rsa | Algorithm::MlDsa => {
                let kind = if algorithm == Algorithm::Rsa {
                    KeyKind::Rsa2048
                } else {
                    KeyKind::MlDsa65
                };
                let key = KeyMaterial::generate(kind)?;
                let params = profile.to_params(kind, serial, not_before)?;
                let cert = params
                    .self_signed(key.key_pair())
                    .map_err(|e| PqcertError::crypto("sign certificate", e))?;
                (cert, key.to_pem())
            }
            Algorithm::Hybrid => {
                let params = profile.to_params(KeyKind::Rsa2048, serial, not_before)?;
                let hybrid = sign_hybrid(params)?;
                let key_pem = format!(
                    "{}{}",
                    hybrid.classical_key.to_pem(),
                    hybrid.post_quantum_key.to_pem()
                );
                (hybrid.certificate, key_pem)
            }
        };

        let cert_pem = certificate.pem();
        let not_after = not_before + time::Duration::days(i64::from(self.validity_days));

        info!(
            domain = %domain,
            algorithm = %algorithm,
            serial = %serial_hex,
            not_after = %to_chrono(not_after),
            "Issued domain-validated certificate"
        );

        Ok(CertificateBundle {
            algorithm,
            fullchain_pem: cert_pem.clone(),
            cert_pem,
            key_pem,
            chain_pem: String::new(),
            cert_der: certificate.der().to_vec(),
            serial: serial_hex,
            not_before: to_chrono(not_before),
            not_after: to_chrono(not_after),
        })
    }
}

impl Default for DomainIssuer {
    fn default() -> Self {
        Self::new(&IssuanceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    fn san_names(cert: &X509Certificate<'_>) -> Vec<String> {
        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SAN extension present");
        san.value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => format!("DNS:{}", dns),
                other => format!("{:?}", other),
            })
            .collect()
    }

    fn check_leaf(algorithm: Algorithm) {
        let bundle = DomainIssuer::default()
            .issue("example.com", algorithm)
            .unwrap();
        let (_, cert) = X509Certificate::from_der(&bundle.cert_der).unwrap();

        let validity = cert.validity();
        assert_eq!(
            validity.not_after.timestamp() - validity.not_before.timestamp(),
            90 * 86400
        );
        assert_eq!(san_names(&cert), vec!["DNS:example.com"]);
        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
        assert!(!cert.is_ca());

        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth && eku.client_auth);

        let ku = cert.key_usage().unwrap().unwrap().value;
        assert!(ku.digital_signature());
        assert_eq!(ku.key_encipherment(), algorithm != Algorithm::MlDsa);

        assert!(bundle.chain_pem.is_empty());
        assert_eq!(bundle.fullchain_pem, bundle.cert_pem);
        assert_eq!(bundle.not_after - bundle.not_before, chrono::Duration::days(90));
    }

    #[test]
    fn test_rsa_leaf() {
        check_leaf(Algorithm::Rsa);
    }

    #[test]
    fn test_ml_dsa_leaf() {
        check_leaf(Algorithm::MlDsa);
        let bundle = DomainIssuer::default()
            .issue("example.com", Algorithm::MlDsa)
            .unwrap();
        let (_, cert) = X509Certificate::from_der(&bundle.cert_der).unwrap();
        assert_eq!(
            cert.signature_algorithm.algorithm.to_id_string(),
            "2.16.840.1.101.3.4.3.18"
        );
    }

    #[test]
    fn test_hybrid_leaf() {
        check_leaf(Algorithm::Hybrid);
        let bundle = DomainIssuer::default()
            .issue("example.com", Algorithm::Hybrid)
            .unwrap();
        assert_eq!(bundle.key_pem.matches("BEGIN PRIVATE KEY").count(), 2);

        let (_, cert) = X509Certificate::from_der(&bundle.cert_der).unwrap();
        let oids: Vec<String> = cert
            .extensions()
            .iter()
            .map(|ext| ext.oid.to_id_string())
            .collect();
        for alt in ["2.5.29.72", "2.5.29.73", "2.5.29.74"] {
            assert!(oids.iter().any(|oid| oid == alt), "missing {alt}");
        }
        assert!(crate::ca::hybrid::verify_hybrid(&bundle.cert_der).unwrap());
    }

    #[test]
    fn test_serials_are_random() {
        let issuer = DomainIssuer::default();
        let a = issuer.issue("a.example.com", Algorithm::Rsa).unwrap();
        let b = issuer.issue("b.example.com", Algorithm::Rsa).unwrap();
        assert_ne!(a.serial, b.serial);
        assert_eq!(a.serial.len(), 32);
    }

    #[test]
    fn test_invalid_domain_rejected() {
        let err = DomainIssuer::default()
            .issue("not_a_domain", Algorithm::Rsa)
            .unwrap_err();
        assert!(matches!(err, PqcertError::InvalidDomain(_)));
    }

    #[test]
    fn test_bundle_debug_redacts_key() {
        let bundle = DomainIssuer::default()
            .issue("example.com", Algorithm::Rsa)
            .unwrap();
        assert!(!format!("{:?}", bundle).contains("PRIVATE KEY"));
    }
}
