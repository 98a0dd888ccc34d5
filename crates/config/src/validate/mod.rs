//! Configuration validation
//!
//! Errors make a configuration unusable; warnings flag settings that work but
//! are probably not what a production install wants.

use std::fmt;

use anyhow::{anyhow, Result};

use crate::{Config, MAX_LOCAL_LEAF_DAYS};

mod certs;
mod lint;

pub use certs::validate_root_ca;
pub use lint::lint_config;

/// Area of the configuration an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Challenge,
    Validator,
    Issuance,
    LocalCa,
    Renewal,
    Client,
    Certificate,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Challenge => "challenge",
            ErrorCategory::Validator => "validator",
            ErrorCategory::Issuance => "issuance",
            ErrorCategory::LocalCa => "local-ca",
            ErrorCategory::Renewal => "renewal",
            ErrorCategory::Client => "client",
            ErrorCategory::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated validation outcome
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a single error listing every problem
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        Err(anyhow!("Invalid configuration:\n  {}", lines.join("\n  ")))
    }
}

/// Structural checks on every block
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.challenge.ttl_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Challenge,
            "ttl-secs must be greater than zero",
        ));
    }
    if !config.challenge.path_prefix.starts_with("/.well-known/") {
        result.add_error(ValidationError::new(
            ErrorCategory::Challenge,
            format!(
                "path-prefix must live under /.well-known/, got {:?}",
                config.challenge.path_prefix
            ),
        ));
    }

    if config.validator.timeout_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Validator,
            "timeout-secs must be greater than zero",
        ));
    }
    if config.validator.max_body_bytes == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Validator,
            "max-body-bytes must be greater than zero",
        ));
    }

    if config.issuance.validity_days == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Issuance,
            "validity-days must be greater than zero",
        ));
    }

    let local = &config.local_ca;
    if local.leaf_validity_days == 0 || local.leaf_validity_days > MAX_LOCAL_LEAF_DAYS {
        result.add_error(ValidationError::new(
            ErrorCategory::LocalCa,
            format!(
                "leaf-validity-days must be between 1 and {}, got {}",
                MAX_LOCAL_LEAF_DAYS, local.leaf_validity_days
            ),
        ));
    }
    if local.root_validity_days <= local.leaf_validity_days {
        result.add_error(ValidationError::new(
            ErrorCategory::LocalCa,
            "root-validity-days must exceed leaf-validity-days",
        ));
    }
    if local.pfx_password.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::LocalCa,
            "pfx-password must not be empty",
        ));
    }
    if local.common_name.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::LocalCa,
            "common-name must not be empty",
        ));
    }

    if config.renewal.threshold_days == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "threshold-days must be greater than zero",
        ));
    }
    if config.renewal.check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "check-interval-secs must be greater than zero",
        ));
    }

    let client = &config.client;
    if !(client.server_url.starts_with("https://") || client.server_url.starts_with("http://")) {
        result.add_error(ValidationError::new(
            ErrorCategory::Client,
            format!("server-url must be an http(s) URL, got {:?}", client.server_url),
        ));
    }
    if client.timeout_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Client,
            "timeout-secs must be greater than zero",
        ));
    }

    result.merge(lint_config(config));
    result
}
