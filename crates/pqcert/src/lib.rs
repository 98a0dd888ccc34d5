//! PQCert
//!
//! Free certificates with classical, post-quantum and hybrid keys.
//!
//! Two issuance paths:
//!
//! - **Domain validated**: a requester proves control of a domain by
//!   publishing a challenge token over HTTP, then downloads a 90-day leaf
//!   (RSA-2048, ML-DSA-65 or an RSA leaf carrying an ML-DSA alternative
//!   signature).
//! - **Local development**: a root CA kept under `~/.pqcert` signs leaves for
//!   `localhost` and friends, and is installed into the OS trust store.
//!
//! [`CertificateFetcher`] drives the domain-validated path from the
//! requesting machine against a remote server (`pqcert get`).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pqcert::{CertificateService, ChallengeManager, DomainIssuer, DomainValidator, MemoryStore, RecordStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let service = CertificateService::new(
//!     ChallengeManager::new(store.clone()),
//!     DomainValidator::new(&Default::default())?,
//!     DomainIssuer::default(),
//!     RecordStore::new(store),
//! );
//! let challenge = service.request(CertificateRequest { domain: "example.com".into(), email: None, algorithm: None })?;
//! // publish challenge.challenge_token at challenge.challenge_url, then
//! let outcome = service.verify(&challenge.challenge_id).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod api;
pub mod ca;
pub mod challenge;
pub mod client;
pub mod error;
pub mod records;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod trust;
pub mod validator;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{PqcertError, Result, StorageError};

// Storage
pub use storage::{FsStore, KvStore, MemoryStore};

// Challenges and validation
pub use challenge::{validate_domain, Challenge, ChallengeManager, ChallengeState};
pub use validator::DomainValidator;

// Issuance
pub use ca::{CertificateBundle, DomainIssuer, LocalAuthority, LocalLeaf, RootCertificate};

// Records and renewal
pub use records::{CertificateRecord, CertificateStatus, RecordOrigin, RecordStore};
pub use scheduler::RenewalScheduler;

// Service
pub use api::{CertificateRequest, ChallengeResponse, VerifyResponse};
pub use service::{CertificateService, RenewalReport};

// Remote issuance client
pub use client::{CertificateFetcher, DownloadMetadata, IssuanceClient};

// Trust stores
pub use trust::{detect_trust_store, TrustInstallResult, TrustStore};

// Shared types
pub use pqcert_common::{Algorithm, CertificateId, ChallengeId, Platform};
