//! Configuration linting
//!
//! Flags settings that are legal but weak outside a developer machine.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, Elevation};

/// Lint configuration for risky defaults
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.local_ca.pfx_password == "pqcert" {
        result.add_warning(ValidationWarning::new(
            "PKCS#12 bundles use the well-known default password 'pqcert'",
        ));
    }

    if config.trust.elevation == Elevation::None {
        result.add_warning(ValidationWarning::new(
            "Trust store commands run without elevation; install will fail unless already privileged",
        ));
    }

    if config.renewal.threshold_days >= config.issuance.validity_days {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal threshold ({} days) is not shorter than the certificate lifetime ({} days); \
             every certificate will be renewed on each scan",
            config.renewal.threshold_days, config.issuance.validity_days
        )));
    }

    if config.challenge.ttl_secs < 60 {
        result.add_warning(ValidationWarning::new(format!(
            "Challenge TTL of {}s leaves little time to publish the token",
            config.challenge.ttl_secs
        )));
    }

    result
}
