//! Issuance service
//!
//! Ties the challenge manager, validator, CA core and record store into the
//! request → verify → download flow, plus renewal.
//!
//! # Verification flow
//!
//! ```text
//! verify(id)
//!   ├── claim in-flight slot for id       (ChallengeInProgress if taken)
//!   ├── load challenge                    (NotFound / Expired)
//!   ├── HTTP check, no locks held         (ValidationFailed → success=false)
//!   ├── mark verified
//!   ├── issue on the blocking pool
//!   ├── save record
//!   └── consume challenge
//! ```

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info};

use pqcert_common::{Algorithm, CertificateId, ChallengeId};

use crate::api::{CertificateRequest, ChallengeResponse, VerifyResponse};
use crate::ca::{DomainIssuer, LocalAuthority, LocalLeaf};
use crate::challenge::{ChallengeManager, ChallengeState};
use crate::error::{PqcertError, Result};
use crate::records::{CertificateRecord, RecordOrigin, RecordStore};
use crate::validator::DomainValidator;

/// Outcome of one renewal pass
#[derive(Debug, Default)]
pub struct RenewalReport {
    /// (replaced record, new record)
    pub renewed: Vec<(CertificateId, CertificateId)>,
    pub failed: Vec<(CertificateId, String)>,
}

impl RenewalReport {
    pub fn is_empty(&self) -> bool {
        self.renewed.is_empty() && self.failed.is_empty()
    }
}

/// Removes the in-flight marker for a challenge when dropped
struct InFlight<'a> {
    set: &'a DashMap<ChallengeId, ()>,
    id: ChallengeId,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a DashMap<ChallengeId, ()>, id: &ChallengeId) -> Result<Self> {
        match set.entry(id.clone()) {
            Entry::Occupied(_) => Err(PqcertError::ChallengeInProgress(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self {
                    set,
                    id: id.clone(),
                })
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Certificate issuance API
#[derive(Debug)]
pub struct CertificateService {
    challenges: ChallengeManager,
    validator: DomainValidator,
    issuer: DomainIssuer,
    records: RecordStore,
    local: Option<Arc<LocalAuthority>>,
    default_algorithm: Algorithm,
    in_flight: DashMap<ChallengeId, ()>,
}

impl CertificateService {
    pub fn new(
        challenges: ChallengeManager,
        validator: DomainValidator,
        issuer: DomainIssuer,
        records: RecordStore,
    ) -> Self {
        Self {
            challenges,
            validator,
            issuer,
            records,
            local: None,
            default_algorithm: Algorithm::default(),
            in_flight: DashMap::new(),
        }
    }

    /// Enable local-CA issuance and renewal of local-CA records
    pub fn with_local_authority(mut self, local: Arc<LocalAuthority>) -> Self {
        self.local = Some(local);
        self
    }

    /// Algorithm used when a request names none
    pub fn with_default_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn local_authority(&self) -> Option<&Arc<LocalAuthority>> {
        self.local.as_ref()
    }

    /// Open a challenge for the requested domain
    pub fn request(&self, request: CertificateRequest) -> Result<ChallengeResponse> {
        let algorithm = request.algorithm.unwrap_or(self.default_algorithm);
        let challenge =
            self.challenges
                .create_challenge(request.domain.trim(), request.email, algorithm)?;
        let url = self
            .challenges
            .challenge_url(&challenge.domain, &challenge.token);
        Ok(ChallengeResponse::new(&challenge, url))
    }

    /// Validate a challenge and, on success, issue its certificate
    ///
    /// A token that is not (yet) reachable yields `success: false`; the same
    /// challenge can be verified again until it expires.
    pub async fn verify(&self, challenge_id: &ChallengeId) -> Result<VerifyResponse> {
        match self.verify_challenge(challenge_id).await {
            Ok(record) => Ok(VerifyResponse::issued(&record)),
            Err(PqcertError::ValidationFailed { domain }) => {
                info!(challenge_id = %challenge_id, domain = %domain, "Domain validation failed");
                Ok(VerifyResponse::failed())
            }
            Err(e) => Err(e),
        }
    }

    /// [`verify`](Self::verify) returning the stored record, with
    /// validation failure as an error
    pub async fn verify_challenge(&self, challenge_id: &ChallengeId) -> Result<CertificateRecord> {
        let _in_flight = InFlight::claim(&self.in_flight, challenge_id)?;

        let challenge = self.challenges.get_challenge(challenge_id)?;
        if challenge.state == ChallengeState::Pending {
            if !self
                .validator
                .verify(&challenge.domain, &challenge.token)
                .await
            {
                return Err(PqcertError::ValidationFailed {
                    domain: challenge.domain,
                });
            }
            self.challenges.mark_verified(challenge_id)?;
        } else {
            // Verified earlier but issuance did not complete
            debug!(challenge_id = %challenge_id, state = ?challenge.state, "Resuming issuance");
        }

        let bundle = self
            .issue_blocking(challenge.domain.clone(), challenge.algorithm)
            .await?;
        let record = CertificateRecord::from_bundle(
            &challenge.domain,
            RecordOrigin::DomainValidated,
            vec![challenge.domain.clone()],
            bundle,
        );
        self.records.save(&record)?;
        self.challenges.consume_challenge(challenge_id)?;

        info!(
            challenge_id = %challenge_id,
            cert_id = %record.id,
            domain = %record.domain,
            algorithm = %record.algorithm,
            "Certificate issued"
        );
        Ok(record)
    }

    async fn issue_blocking(
        &self,
        domain: String,
        algorithm: Algorithm,
    ) -> Result<crate::ca::CertificateBundle> {
        let issuer = self.issuer.clone();
        tokio::task::spawn_blocking(move || issuer.issue(&domain, algorithm))
            .await
            .map_err(|e| PqcertError::crypto("issue certificate", e))?
    }

    /// One allow-listed artifact of an issued certificate
    ///
    /// A renewed certificate's id keeps working: the newest renewal is served.
    pub fn download(&self, cert_id: &str, filename: &str) -> Result<Vec<u8>> {
        let id = CertificateId::parse(cert_id)
            .map_err(|_| PqcertError::CertificateNotFound(cert_id.to_string()))?;
        self.records.lookup(&id, filename)
    }

    /// Sign a local development leaf and record it
    pub async fn issue_local(
        &self,
        name: &str,
        extra_hosts: Vec<String>,
    ) -> Result<(LocalLeaf, CertificateRecord)> {
        let (leaf, record) = self.sign_local(name, extra_hosts).await?;
        self.records.save(&record)?;
        Ok((leaf, record))
    }

    async fn sign_local(
        &self,
        name: &str,
        extra_hosts: Vec<String>,
    ) -> Result<(LocalLeaf, CertificateRecord)> {
        let local = self
            .local
            .clone()
            .ok_or_else(|| PqcertError::crypto("issue local certificate", "local CA disabled"))?;
        let owned_name = name.to_string();
        let leaf = tokio::task::spawn_blocking(move || local.issue_local(&owned_name, &extra_hosts))
            .await
            .map_err(|e| PqcertError::crypto("issue local certificate", e))??;

        let record = CertificateRecord::from_bundle(
            name,
            RecordOrigin::LocalCa,
            leaf.subject_alt_names.clone(),
            leaf.bundle.clone(),
        );
        Ok((leaf, record))
    }

    /// Re-issue every record expiring within `threshold_days`
    ///
    /// Each renewal is a new record referencing the old one; failures are
    /// collected and do not stop the pass.
    pub async fn renew_expiring(&self, threshold_days: u32) -> Result<RenewalReport> {
        let due = self.records.scan_for_renewal(threshold_days)?;
        info!(due = due.len(), threshold_days, "Checking certificates for renewal");

        let mut report = RenewalReport::default();
        for old in due {
            match self.renew_one(&old).await {
                Ok(new) => {
                    info!(
                        old_cert_id = %old.id,
                        cert_id = %new.id,
                        domain = %old.domain,
                        expires_at = %new.expires_at,
                        "Certificate renewed"
                    );
                    report.renewed.push((old.id, new.id));
                }
                Err(e) => {
                    error!(cert_id = %old.id, domain = %old.domain, error = %e, "Certificate renewal failed");
                    report.failed.push((old.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn renew_one(&self, old: &CertificateRecord) -> Result<CertificateRecord> {
        let record = match old.origin {
            RecordOrigin::DomainValidated => {
                let bundle = self
                    .issue_blocking(old.domain.clone(), old.algorithm)
                    .await?;
                CertificateRecord::from_bundle(
                    &old.domain,
                    RecordOrigin::DomainValidated,
                    old.subject_alt_names.clone(),
                    bundle,
                )
            }
            RecordOrigin::LocalCa => {
                let (_, record) = self
                    .sign_local(&old.domain, old.subject_alt_names.clone())
                    .await?;
                record
            }
        };

        let record = record.renewing(&old.id);
        self.records.save(&record)?;
        Ok(record)
    }

    /// Drop expired challenges and expired certificate records
    pub fn cleanup(&self) -> Result<(usize, usize)> {
        let challenges = self.challenges.sweep_expired()?;
        let records = self.records.remove_expired()?;
        if challenges + records > 0 {
            info!(challenges, records, "Removed expired state");
        }
        Ok((challenges, records))
    }
}
