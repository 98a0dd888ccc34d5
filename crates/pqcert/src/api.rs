//! Request and response bodies of the certificate HTTP API
//!
//! | Method | Path                                  | Body / response                |
//! |--------|---------------------------------------|--------------------------------|
//! | POST   | `/v1/certificate/request`             | [`CertificateRequest`] → [`ChallengeResponse`] |
//! | POST   | `/v1/certificate/verify/{challenge}`  | → [`VerifyResponse`]           |
//! | GET    | `/v1/certificate/{cert}/{file}`       | PEM artifact                   |
//!
//! Routing lives outside this crate; these types fix the JSON contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pqcert_common::{Algorithm, CertificateId, ChallengeId};

use crate::challenge::Challenge;
use crate::records::CertificateRecord;

pub const REQUEST_PATH: &str = "/v1/certificate/request";
pub const VERIFY_PATH_PREFIX: &str = "/v1/certificate/verify/";
pub const DOWNLOAD_PATH_PREFIX: &str = "/v1/certificate/";

/// Download path of one artifact of a certificate
pub fn artifact_url(id: &CertificateId, filename: &str) -> String {
    format!("{}{}/{}", DOWNLOAD_PATH_PREFIX, id, filename)
}

/// Body of `POST /v1/certificate/request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Server default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
}

/// Challenge handed back to the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: ChallengeId,
    pub challenge_token: String,
    pub challenge_url: String,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeResponse {
    pub fn new(challenge: &Challenge, challenge_url: String) -> Self {
        Self {
            challenge_id: challenge.id.clone(),
            challenge_token: challenge.token.clone(),
            challenge_url,
            expires_at: challenge.expires_at,
        }
    }
}

/// Outcome of `POST /v1/certificate/verify/{challenge_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<CertificateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl VerifyResponse {
    /// Token not found at the domain; the challenge may be retried
    pub fn failed() -> Self {
        Self {
            success: false,
            certificate_id: None,
            cert_url: None,
            key_url: None,
            chain_url: None,
            expires_at: None,
        }
    }

    pub fn issued(record: &CertificateRecord) -> Self {
        Self {
            success: true,
            cert_url: Some(artifact_url(&record.id, "cert.pem")),
            key_url: Some(artifact_url(&record.id, "key.pem")),
            chain_url: Some(artifact_url(&record.id, "chain.pem")),
            certificate_id: Some(record.id.clone()),
            expires_at: Some(record.expires_at),
        }
    }
}
