//! Error types for certificate issuance, challenges and trust stores.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the PQCert core
#[derive(Debug, Error)]
pub enum PqcertError {
    /// Domain failed hostname syntax validation
    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    /// No challenge with this id exists (never created, or already consumed)
    #[error("challenge not found: {0}")]
    ChallengeNotFound(String),

    /// Challenge outlived its TTL; a fresh request is required
    #[error("challenge expired: {0}")]
    ChallengeExpired(String),

    /// Challenge must be verified before it can be consumed
    #[error("challenge not verified: {0}")]
    ChallengeNotVerified(String),

    /// Another verification of the same challenge is running
    #[error("challenge verification already in progress: {0}")]
    ChallengeInProgress(String),

    /// Token was not reachable at the claimed domain
    #[error("domain validation failed for '{domain}'")]
    ValidationFailed { domain: String },

    /// Key generation, signing or encoding failed
    #[error("crypto operation '{operation}' failed: {reason}")]
    CryptoOperationFailed { operation: &'static str, reason: String },

    /// No trust store implementation for this OS
    #[error("trust store not supported on this platform ({0})")]
    TrustStoreUnsupportedPlatform(String),

    /// Trust store change needs privileges the process lacks
    #[error("permission denied by {mechanism}: {detail}")]
    PermissionDenied { mechanism: String, detail: String },

    /// Trust store command failed for a reason other than privileges
    #[error("trust store operation via {mechanism} failed: {detail}")]
    TrustStoreFailed { mechanism: String, detail: String },

    /// No certificate record with this id
    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// Requested download is not an allowed artifact name
    #[error("artifact '{0}' is not downloadable")]
    InvalidArtifact(String),

    /// Remote issuance server was unreachable or answered with an error
    #[error("issuance server request '{operation}' failed: {reason}")]
    ServerRequestFailed { operation: &'static str, reason: String },

    /// Storage backend failure
    #[error("storage failure: {0}")]
    StorageIOFailed(#[from] StorageError),
}

impl PqcertError {
    /// Crypto failure for `operation`; `reason` must not contain key bytes
    pub fn crypto(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::CryptoOperationFailed {
            operation,
            reason: reason.to_string(),
        }
    }
}

impl PqcertError {
    /// Failure talking to the issuance server during `operation`
    pub fn server(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::ServerRequestFailed {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Errors from the key-value storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key contains characters or segments outside the allowed set
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, PqcertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_names_path() {
        let err = StorageError::io(
            "/var/lib/pqcert/certs/abc",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/var/lib/pqcert/certs/abc"));

        let wrapped: PqcertError = err.into();
        assert!(matches!(wrapped, PqcertError::StorageIOFailed(_)));
    }

    #[test]
    fn test_crypto_error_names_operation() {
        let err = PqcertError::crypto("sign certificate", "bad key");
        assert_eq!(
            err.to_string(),
            "crypto operation 'sign certificate' failed: bad key"
        );
    }

    #[test]
    fn test_permission_denied_names_mechanism() {
        let err = PqcertError::PermissionDenied {
            mechanism: "macos-keychain (security add-trusted-cert)".to_string(),
            detail: "authorization denied".to_string(),
        };
        assert!(err.to_string().contains("macos-keychain"));
    }
}
