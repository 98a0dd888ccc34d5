//! Issued certificate records
//!
//! Every issuance produces one immutable [`CertificateRecord`] stored as a
//! JSON document under `certs/<certificate-id>`. Renewal writes a new record
//! pointing back at the one it replaces; the old record is left untouched
//! until explicit expiry cleanup.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pqcert_common::{Algorithm, CertificateId};

use crate::ca::CertificateBundle;
use crate::error::{PqcertError, Result};
use crate::storage::{get_json, put_json, KvStore};

const RECORD_PREFIX: &str = "certs/";

/// Artifact names that may be downloaded
pub const DOWNLOADABLE_ARTIFACTS: &[&str] = &["cert.pem", "key.pem", "chain.pem", "fullchain.pem"];

/// Days remaining at or below which a certificate is flagged
const RENEW_SOON_DAYS: i64 = 30;
const CRITICAL_DAYS: i64 = 7;

/// How a certificate was issued, and therefore how it is renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordOrigin {
    /// Self-signed after HTTP challenge validation
    DomainValidated,
    /// Signed by the local development root
    LocalCa,
}

/// Expiry classification shown by `pqcert status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateStatus {
    Ok,
    RenewSoon,
    Critical,
    Expired,
}

impl CertificateStatus {
    /// Classify by whole days until expiry
    pub fn from_days_remaining(days: i64) -> Self {
        if days < 0 {
            CertificateStatus::Expired
        } else if days <= CRITICAL_DAYS {
            CertificateStatus::Critical
        } else if days <= RENEW_SOON_DAYS {
            CertificateStatus::RenewSoon
        } else {
            CertificateStatus::Ok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Ok => "ok",
            CertificateStatus::RenewSoon => "renew-soon",
            CertificateStatus::Critical => "critical",
            CertificateStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted certificate with its key and chain
#[derive(Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: CertificateId,
    pub domain: String,
    pub algorithm: Algorithm,
    pub origin: RecordOrigin,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    pub serial: String,
    pub leaf_cert: String,
    pub leaf_key: String,
    pub chain: String,
    pub fullchain: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Record this one replaced through renewal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_from: Option<CertificateId>,
}

impl CertificateRecord {
    /// New record with a fresh id for an issued bundle
    pub fn from_bundle(
        domain: &str,
        origin: RecordOrigin,
        subject_alt_names: Vec<String>,
        bundle: CertificateBundle,
    ) -> Self {
        Self {
            id: CertificateId::new(),
            domain: domain.to_string(),
            algorithm: bundle.algorithm,
            origin,
            subject_alt_names,
            serial: bundle.serial,
            leaf_cert: bundle.cert_pem,
            leaf_key: bundle.key_pem,
            chain: bundle.chain_pem,
            fullchain: bundle.fullchain_pem,
            issued_at: bundle.not_before,
            expires_at: bundle.not_after,
            renewed_from: None,
        }
    }

    /// Mark this record as the renewal of `previous`
    pub fn renewing(mut self, previous: &CertificateId) -> Self {
        self.renewed_from = Some(previous.clone());
        self
    }

    /// Whole days until expiry; negative once expired
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }

    pub fn days_remaining(&self) -> i64 {
        self.days_remaining_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CertificateStatus {
        if self.expires_at <= now {
            return CertificateStatus::Expired;
        }
        CertificateStatus::from_days_remaining(self.days_remaining_at(now))
    }

    pub fn status(&self) -> CertificateStatus {
        self.status_at(Utc::now())
    }

    /// Content of a downloadable artifact
    pub fn artifact(&self, filename: &str) -> Result<&str> {
        match filename {
            "cert.pem" => Ok(&self.leaf_cert),
            "key.pem" => Ok(&self.leaf_key),
            "chain.pem" => Ok(&self.chain),
            "fullchain.pem" => Ok(&self.fullchain),
            other => Err(PqcertError::InvalidArtifact(other.to_string())),
        }
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("algorithm", &self.algorithm)
            .field("origin", &self.origin)
            .field("serial", &self.serial)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("renewed_from", &self.renewed_from)
            .field("leaf_key", &"<redacted>")
            .finish()
    }
}

/// Certificate records on top of a [`KvStore`]
#[derive(Debug, Clone)]
pub struct RecordStore {
    store: Arc<dyn KvStore>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(id: &CertificateId) -> String {
        format!("{}{}", RECORD_PREFIX, id)
    }

    /// Persist a record in a single atomic write
    pub fn save(&self, record: &CertificateRecord) -> Result<()> {
        put_json(self.store.as_ref(), &Self::key(&record.id), record)?;
        info!(
            cert_id = %record.id,
            domain = %record.domain,
            algorithm = %record.algorithm,
            expires_at = %record.expires_at,
            "Saved certificate record"
        );
        Ok(())
    }

    pub fn load(&self, id: &CertificateId) -> Result<CertificateRecord> {
        get_json(self.store.as_ref(), &Self::key(id))?
            .ok_or_else(|| PqcertError::CertificateNotFound(id.to_string()))
    }

    /// Bytes of one allow-listed artifact of the newest record in `id`'s
    /// renewal chain
    pub fn lookup(&self, id: &CertificateId, filename: &str) -> Result<Vec<u8>> {
        if !DOWNLOADABLE_ARTIFACTS.contains(&filename) {
            return Err(PqcertError::InvalidArtifact(filename.to_string()));
        }
        let record = self.latest(id)?;
        debug!(
            cert_id = %id,
            served_id = %record.id,
            artifact = %filename,
            "Artifact lookup"
        );
        Ok(record.artifact(filename)?.as_bytes().to_vec())
    }

    /// Most recent record that renewed `id`, if any
    pub fn successor_of(&self, id: &CertificateId) -> Result<Option<CertificateRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.renewed_from.as_ref() == Some(id))
            .max_by_key(|r| r.issued_at))
    }

    /// Follow renewals from `id` to the newest record
    ///
    /// Returns the record for `id` itself when it was never renewed.
    pub fn latest(&self, id: &CertificateId) -> Result<CertificateRecord> {
        let records = self.list()?;
        let mut current = id.clone();
        // Bounded by the record count so a corrupt cycle cannot spin
        for _ in 0..records.len() {
            let next = records
                .iter()
                .filter(|r| r.renewed_from.as_ref() == Some(&current))
                .max_by_key(|r| r.issued_at);
            match next {
                Some(record) => current = record.id.clone(),
                None => break,
            }
        }
        if current != *id {
            debug!(cert_id = %id, latest_id = %current, "Following renewal chain");
        }
        self.load(&current)
    }

    /// Every readable record, oldest issuance first
    ///
    /// Unparsable records are logged and skipped.
    pub fn list(&self) -> Result<Vec<CertificateRecord>> {
        let mut records = Vec::new();
        for key in self.store.list(RECORD_PREFIX)? {
            match get_json::<CertificateRecord>(self.store.as_ref(), &key) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable certificate record"),
            }
        }
        records.sort_by_key(|r| r.issued_at);
        Ok(records)
    }

    /// Records expiring within `threshold_days`, soonest first
    ///
    /// Records already replaced by a renewal are not returned again.
    pub fn scan_for_renewal(&self, threshold_days: u32) -> Result<Vec<CertificateRecord>> {
        self.scan_for_renewal_at(threshold_days, Utc::now())
    }

    pub fn scan_for_renewal_at(
        &self,
        threshold_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>> {
        let records = self.list()?;
        let superseded: Vec<CertificateId> = records
            .iter()
            .filter_map(|r| r.renewed_from.clone())
            .collect();
        let horizon = now + Duration::days(i64::from(threshold_days));

        let mut due: Vec<CertificateRecord> = records
            .into_iter()
            .filter(|r| r.expires_at <= horizon && !superseded.contains(&r.id))
            .collect();
        due.sort_by_key(|r| r.expires_at);

        debug!(threshold_days, due = due.len(), "Scanned records for renewal");
        Ok(due)
    }

    /// Delete every expired record. Returns how many were removed.
    pub fn remove_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for record in self.list()? {
            if record.expires_at <= now && self.store.remove(&Self::key(&record.id))? {
                debug!(cert_id = %record.id, domain = %record.domain, "Removed expired record");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Removed expired certificate records");
        }
        Ok(removed)
    }
}
