//! Type-safe identifier newtypes for PQCert.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of different ID types (e.g., passing a ChallengeId
//! where a CertificateId is expected). Both are backed by random UUIDv4
//! values, so concurrent creations never need a shared counter.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// An identifier string that is not a well-formed UUID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier: {0:?}")]
pub struct InvalidId(pub String);

/// Domain-validation challenge identifier.
///
/// Handed to the caller when a certificate is requested and presented
/// again when asking for verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId(String);

impl ChallengeId {
    /// Create a new random challenge ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse an externally supplied ID.
    ///
    /// Only canonical UUIDs are accepted; anything else is rejected before it
    /// can reach a storage key.
    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        parse_uuid(s).map(Self)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChallengeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issued certificate identifier.
///
/// Keys the certificate record store and appears in download URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateId(String);

impl CertificateId {
    /// Create a new random certificate ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse an externally supplied ID
    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        parse_uuid(s).map(Self)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CertificateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn parse_uuid(s: &str) -> Result<String, InvalidId> {
    Uuid::parse_str(s)
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| InvalidId(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_challenge_id() {
        let id1 = ChallengeId::new();
        let id2 = ChallengeId::new();

        assert_ne!(id1, id2);
        assert_eq!(ChallengeId::parse(id1.as_str()).unwrap(), id1);
    }

    #[test]
    fn test_certificate_id() {
        let id = CertificateId::new();
        assert_eq!(id.to_string(), id.as_str());
        assert_eq!(CertificateId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_path_segments() {
        assert!(CertificateId::parse("../../etc/passwd").is_err());
        assert!(ChallengeId::parse("").is_err());
        assert!(ChallengeId::parse("abc/def").is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| ChallengeId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
