//! Root CA validation
//!
//! Checks the on-disk local root certificate, if one has been generated.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// File name of the PEM root certificate inside the CA directory
pub const ROOT_CERT_FILE: &str = "pqcert-ca.pem";

/// Validate the local root CA certificate
pub fn validate_root_ca(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let cert_path = config.local_ca.ca_dir().join(ROOT_CERT_FILE);

    // Not generated yet; the first `localhost` run creates it
    if !cert_path.exists() {
        return result;
    }

    match load_and_check_expiry(&cert_path) {
        Ok(Some(warning)) => result.add_warning(warning),
        Ok(None) => {}
        Err(e) => result.add_error(e),
    }

    result
}

fn load_and_check_expiry(cert_path: &Path) -> Result<Option<ValidationWarning>, ValidationError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read root certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse root certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 root certificate {:?}: {}", cert_path, e),
        )
    })?;

    let not_after = cert.validity().not_after.timestamp().max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);
    let now = SystemTime::now();

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Root CA certificate expired at {}; delete {:?} and rerun `pqcert localhost`",
                cert.validity().not_after,
                cert_path.parent().unwrap_or(cert_path)
            ),
        ));
    }

    if expiry_time < now + Duration::from_secs(30 * 86400) {
        return Ok(Some(ValidationWarning::new(format!(
            "Root CA certificate expires soon (at {})",
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use time::{Duration as TimeDuration, OffsetDateTime};

    fn write_root(dir: &Path, not_after: OffsetDateTime) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(400);
        params.not_after = not_after;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let ca_dir = dir.join("ca");
        std::fs::create_dir_all(&ca_dir).unwrap();
        std::fs::write(ca_dir.join(ROOT_CERT_FILE), cert.pem()).unwrap();
    }

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::default();
        config.local_ca.base_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_missing_root_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate_root_ca(&config_for(dir.path()));
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_expired_root() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path(), OffsetDateTime::now_utc() - TimeDuration::days(1));

        let result = validate_root_ca(&config_for(dir.path()));
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("expired")));
    }

    #[test]
    fn test_root_expiring_soon() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path(), OffsetDateTime::now_utc() + TimeDuration::days(10));

        let result = validate_root_ca(&config_for(dir.path()));
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_corrupt_root() {
        let dir = tempfile::tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        std::fs::create_dir_all(&ca_dir).unwrap();
        std::fs::write(ca_dir.join(ROOT_CERT_FILE), "not a certificate").unwrap();

        let result = validate_root_ca(&config_for(dir.path()));
        assert!(!result.errors.is_empty());
    }
}
