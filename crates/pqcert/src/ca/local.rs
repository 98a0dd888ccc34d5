//! Local development certificate authority
//!
//! # Directory Structure
//!
//! ```text
//! base-dir/
//! ├── ca/                          (0700)
//! │   ├── pqcert-ca-key.pem        (0600) root private key
//! │   ├── pqcert-ca.pem            root certificate
//! │   ├── pqcert-ca.crt            root certificate, trust-store copy
//! │   ├── serial                   next leaf serial number
//! │   └── serial.lock              advisory lock held while signing
//! └── certs/
//!     └── <name>/
//!         ├── <name>.pem
//!         ├── <name>-key.pem       (0600)
//!         ├── <name>.crt
//!         ├── <name>-fullchain.pem
//!         └── <name>.pfx
//! ```

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs4::fs_std::FileExt;
use once_cell::sync::Lazy;
use openssl::hash::MessageDigest;
use openssl::x509::X509;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use time::Duration;
use tracing::{debug, info, warn};

use pqcert_common::Algorithm;
use pqcert_config::{LocalCaConfig, MAX_LOCAL_LEAF_DAYS};

use super::crypto::{KeyKind, KeyMaterial};
use super::pkcs12::build_pfx;
use super::profile::{now_seconds, random_serial, to_chrono, LeafProfile};
use super::CertificateBundle;
use crate::error::{PqcertError, Result, StorageError};
use crate::storage::{create_private_dir, validate_key, write_atomic};

pub const CA_KEY_FILE: &str = "pqcert-ca-key.pem";
pub const CA_CERT_FILE: &str = "pqcert-ca.pem";
pub const CA_CERT_CRT_FILE: &str = "pqcert-ca.crt";
pub const SERIAL_FILE: &str = "serial";
pub const SERIAL_LOCK_FILE: &str = "serial.lock";

/// One in-process lock per CA directory, shared by every `LocalAuthority`
/// pointing at it
static SIGNING_LOCKS: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Hostnames every local leaf is valid for, ahead of configured aliases
const LOOPBACK_NAMES: &[&str] = &["localhost", "*.localhost", "127.0.0.1", "::1"];

/// Public half of the root CA, as handed to trust stores
#[derive(Debug, Clone)]
pub struct RootCertificate {
    pub common_name: String,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    /// PEM file
    pub pem_path: PathBuf,
    /// Trust-store copy (`.crt`)
    pub crt_path: PathBuf,
    pub not_after: DateTime<Utc>,
    /// Colon-separated upper-case SHA-256 fingerprint
    pub fingerprint: String,
}

/// On-disk artifacts of a local leaf
#[derive(Debug, Clone)]
pub struct LocalLeafPaths {
    pub dir: PathBuf,
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
    pub cert_crt: PathBuf,
    pub fullchain_pem: PathBuf,
    pub pfx: PathBuf,
}

impl LocalLeafPaths {
    fn new(certs_dir: &Path, name: &str) -> Self {
        let dir = certs_dir.join(name);
        Self {
            cert_pem: dir.join(format!("{}.pem", name)),
            key_pem: dir.join(format!("{}-key.pem", name)),
            cert_crt: dir.join(format!("{}.crt", name)),
            fullchain_pem: dir.join(format!("{}-fullchain.pem", name)),
            pfx: dir.join(format!("{}.pfx", name)),
            dir,
        }
    }
}

/// A leaf signed by the local root
#[derive(Debug, Clone)]
pub struct LocalLeaf {
    pub name: String,
    pub subject_alt_names: Vec<String>,
    pub bundle: CertificateBundle,
    pub paths: LocalLeafPaths,
}

/// Owns the local root CA and signs leaves with it
///
/// The root is created lazily on first use and reused afterwards. Loading
/// the root, reading the serial counter, signing and persisting the next
/// counter value happen under one lock so no two leaves share a serial.
/// The lock is keyed by CA directory within the process and backed by an
/// exclusive advisory lock on `ca/serial.lock` across processes.
#[derive(Debug)]
pub struct LocalAuthority {
    config: LocalCaConfig,
}

impl LocalAuthority {
    pub fn new(config: LocalCaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalCaConfig {
        &self.config
    }

    fn ca_file(&self, name: &str) -> PathBuf {
        self.config.ca_dir().join(name)
    }

    /// Run `f` while holding the CA directory's signing lock
    fn with_signing_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let ca_dir = self.config.ca_dir();
        let lock = SIGNING_LOCKS.entry(ca_dir.clone()).or_default().clone();
        let _guard = lock.lock();

        create_private_dir(&ca_dir)?;
        let lock_path = ca_dir.join(SERIAL_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StorageError::io(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| StorageError::io(&lock_path, e))?;

        // Closing the file releases the advisory lock
        let result = f();
        drop(lock_file);
        result
    }

    /// Create the root CA unless a complete key/certificate pair exists
    pub fn ensure_root_ca(&self) -> Result<RootCertificate> {
        self.with_signing_lock(|| self.ensure_root_locked())
    }

    fn ensure_root_locked(&self) -> Result<RootCertificate> {
        let key_path = self.ca_file(CA_KEY_FILE);
        let cert_path = self.ca_file(CA_CERT_FILE);

        match (key_path.exists(), cert_path.exists()) {
            (true, true) => {
                debug!(ca_dir = %self.config.ca_dir().display(), "Reusing existing root CA");
                return self.load_root_certificate();
            }
            (false, false) => {}
            _ => warn!(
                ca_dir = %self.config.ca_dir().display(),
                "Incomplete root CA on disk, regenerating"
            ),
        }

        self.generate_root()?;
        self.load_root_certificate()
    }

    fn generate_root(&self) -> Result<()> {
        let ca_dir = self.config.ca_dir();
        create_private_dir(&ca_dir)?;

        info!(
            common_name = %self.config.common_name,
            validity_days = self.config.root_validity_days,
            "Generating local root CA (RSA 4096)"
        );

        let key = KeyMaterial::generate(KeyKind::Rsa4096)?;
        let params = self.root_params();
        let cert = params
            .self_signed(key.key_pair())
            .map_err(|e| PqcertError::crypto("sign root certificate", e))?;
        let cert_pem = cert.pem();

        let key_path = self.ca_file(CA_KEY_FILE);
        let cert_path = self.ca_file(CA_CERT_FILE);

        write_atomic(&key_path, key.to_pem().as_bytes(), 0o600)?;
        if let Err(e) = write_atomic(&cert_path, cert_pem.as_bytes(), 0o644) {
            // Never leave a key without its certificate
            let _ = fs::remove_file(&key_path);
            return Err(e.into());
        }
        write_atomic(&self.ca_file(CA_CERT_CRT_FILE), cert_pem.as_bytes(), 0o644)?;
        write_atomic(&self.ca_file(SERIAL_FILE), b"1\n", 0o600)?;

        info!(path = %cert_path.display(), "Root CA written");
        Ok(())
    }

    fn root_params(&self) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, self.config.country.as_str());
        dn.push(DnType::OrganizationName, self.config.organization.as_str());
        dn.push(
            DnType::OrganizationalUnitName,
            self.config.organizational_unit.as_str(),
        );
        dn.push(DnType::CommonName, self.config.common_name.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());

        let not_before = now_seconds();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(self.config.root_validity_days));
        params
    }

    /// The root certificate if one has been generated
    pub fn root_certificate(&self) -> Result<Option<RootCertificate>> {
        if !self.ca_file(CA_CERT_FILE).exists() {
            return Ok(None);
        }
        self.load_root_certificate().map(Some)
    }

    fn load_root_certificate(&self) -> Result<RootCertificate> {
        let pem_path = self.ca_file(CA_CERT_FILE);
        let cert_pem = read_to_string(&pem_path)?;

        let x509 = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| PqcertError::crypto("parse root certificate", e))?;
        let cert_der = x509
            .to_der()
            .map_err(|e| PqcertError::crypto("parse root certificate", e))?;
        let digest = x509
            .digest(MessageDigest::sha256())
            .map_err(|e| PqcertError::crypto("fingerprint root certificate", e))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|e| PqcertError::crypto("parse root certificate", e))?;
        let not_after = DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
            .unwrap_or_default();

        Ok(RootCertificate {
            common_name: self.config.common_name.clone(),
            cert_pem,
            fingerprint: digest
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
            cert_der,
            pem_path,
            crt_path: self.ca_file(CA_CERT_CRT_FILE),
            not_after,
        })
    }

    /// Delete the root CA files. Returns whether anything was removed.
    pub fn remove_root_ca(&self) -> Result<bool> {
        if !self.config.ca_dir().exists() {
            return Ok(false);
        }
        let removed = self.with_signing_lock(|| {
            let mut removed = false;
            for name in [CA_KEY_FILE, CA_CERT_FILE, CA_CERT_CRT_FILE, SERIAL_FILE] {
                let path = self.ca_file(name);
                match fs::remove_file(&path) {
                    Ok(()) => removed = true,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::io(path, e).into()),
                }
            }
            Ok(removed)
        })?;
        if removed {
            info!(ca_dir = %self.config.ca_dir().display(), "Removed local root CA");
        }
        Ok(removed)
    }

    /// SANs for a leaf named `name`: loopback names, configured aliases,
    /// `extra_hosts`, then `name` itself, without duplicates
    pub fn subject_alt_names(&self, name: &str, extra_hosts: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let candidates = LOOPBACK_NAMES
            .iter()
            .map(|s| s.to_string())
            .chain(self.config.aliases.iter().cloned())
            .chain(extra_hosts.iter().cloned())
            .chain(std::iter::once(name.to_string()));
        for candidate in candidates {
            if !names.contains(&candidate) {
                names.push(candidate);
            }
        }
        names
    }

    /// Sign a leaf for `name` with the root CA and write its artifacts
    ///
    /// Creates the root on first use. `name` becomes the subject CN and the
    /// artifact directory name.
    pub fn issue_local(&self, name: &str, extra_hosts: &[String]) -> Result<LocalLeaf> {
        if name.contains('/') || validate_key(name).is_err() {
            return Err(PqcertError::InvalidDomain(name.to_string()));
        }

        let sans = self.subject_alt_names(name, extra_hosts);
        let profile = LeafProfile {
            common_name: name.to_string(),
            organization: Some(self.config.organization.clone()),
            organizational_unit: Some(self.config.organizational_unit.clone()),
            subject_alt_names: sans.clone(),
            validity_days: self.config.leaf_validity_days.min(MAX_LOCAL_LEAF_DAYS),
        };

        // Key generation needs no shared state
        let leaf_key = KeyMaterial::generate(KeyKind::Rsa2048)?;
        let not_before = now_seconds();

        let (root, leaf_cert, serial) = self.with_signing_lock(|| {
            let root = self.ensure_root_locked()?;
            let issuer = self.load_issuer(&root)?;

            let counter = self.read_serial()?;
            let mut params =
                profile.to_params(KeyKind::Rsa2048, SerialNumber::from(counter), not_before)?;
            params.use_authority_key_identifier_extension = true;

            let leaf_cert = params
                .signed_by(leaf_key.key_pair(), &issuer)
                .map_err(|e| PqcertError::crypto("sign certificate", e))?;

            let next = counter
                .checked_add(1)
                .ok_or_else(|| PqcertError::crypto("advance serial counter", "counter exhausted"))?;
            write_atomic(
                &self.ca_file(SERIAL_FILE),
                format!("{}\n", next).as_bytes(),
                0o600,
            )?;

            debug!(name = %name, serial = counter, "Signed local leaf");
            Ok((root, leaf_cert, counter_hex(counter)))
        })?;

        let cert_pem = leaf_cert.pem();
        let key_pem = leaf_key.to_pem();
        let fullchain_pem = format!("{}{}", cert_pem, root.cert_pem);
        let pfx = build_pfx(
            name,
            &leaf_key.to_pkcs8_der(),
            leaf_cert.der(),
            &root.cert_der,
            &self.config.pfx_password,
        )?;

        let paths = LocalLeafPaths::new(&self.config.certs_dir(), name);
        create_private_dir(&self.config.certs_dir())?;
        create_private_dir(&paths.dir)?;
        write_atomic(&paths.key_pem, key_pem.as_bytes(), 0o600)?;
        write_atomic(&paths.cert_pem, cert_pem.as_bytes(), 0o644)?;
        write_atomic(&paths.cert_crt, cert_pem.as_bytes(), 0o644)?;
        write_atomic(&paths.fullchain_pem, fullchain_pem.as_bytes(), 0o644)?;
        write_atomic(&paths.pfx, &pfx, 0o600)?;

        let not_after = not_before + Duration::days(i64::from(profile.validity_days));
        info!(
            name = %name,
            serial = %serial,
            san_count = sans.len(),
            not_after = %to_chrono(not_after),
            dir = %paths.dir.display(),
            "Issued local development certificate"
        );

        Ok(LocalLeaf {
            name: name.to_string(),
            subject_alt_names: sans,
            bundle: CertificateBundle {
                algorithm: Algorithm::Rsa,
                cert_der: leaf_cert.der().to_vec(),
                cert_pem,
                key_pem,
                chain_pem: root.cert_pem.clone(),
                fullchain_pem,
                serial,
                not_before: to_chrono(not_before),
                not_after: to_chrono(not_after),
            },
            paths,
        })
    }

    fn load_issuer(&self, root: &RootCertificate) -> Result<Issuer<'static, KeyPair>> {
        let key_pem = read_to_string(&self.ca_file(CA_KEY_FILE))?;
        let key = KeyMaterial::from_pem(KeyKind::Rsa4096, &key_pem)?;
        Issuer::from_ca_cert_pem(&root.cert_pem, key.into_key_pair())
            .map_err(|e| PqcertError::crypto("load root issuer", e))
    }

    fn read_serial(&self) -> Result<u64> {
        let path = self.ca_file(SERIAL_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse::<u64>().map_err(|e| {
                PqcertError::crypto(
                    "read serial counter",
                    format!("{}: {}", path.display(), e),
                )
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(1),
            Err(e) => Err(StorageError::io(path, e).into()),
        }
    }
}

/// Minimal big-endian hex, as the serial appears in the DER encoding
fn counter_hex(counter: u64) -> String {
    let hex: String = counter
        .to_be_bytes()
        .iter()
        .skip_while(|b| **b == 0)
        .map(|b| format!("{:02x}", b))
        .collect();
    if hex.is_empty() {
        "00".to_string()
    } else {
        hex
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| StorageError::io(path, e).into())
}
