//! Fetching certificates from a remote PQCert server
//!
//! The `pqcert get` flow, run on the machine that serves the domain:
//!
//! 1. `POST /v1/certificate/request` for the domain
//! 2. write the token below the web root at the challenge URL's path
//! 3. `POST /v1/certificate/verify/{challenge}`
//! 4. download `cert.pem`, `key.pem`, `chain.pem` and `fullchain.pem` into
//!    `<certs-dir>/<domain>/` and record [`DownloadMetadata`] next to them
//!
//! The token file is removed again whatever the outcome.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use pqcert_common::{Algorithm, CertificateId, ChallengeId};
use pqcert_config::ClientConfig;

use crate::api::{
    artifact_url, CertificateRequest, ChallengeResponse, VerifyResponse, REQUEST_PATH,
    VERIFY_PATH_PREFIX,
};
use crate::challenge::validate_domain;
use crate::error::{PqcertError, Result, StorageError};
use crate::records::DOWNLOADABLE_ARTIFACTS;
use crate::storage::{create_private_dir, write_atomic};

/// Per-domain metadata file written after a successful download
pub const METADATA_FILE: &str = "metadata.json";

/// Thin client for the certificate HTTP API
#[derive(Debug, Clone)]
pub struct IssuanceClient {
    http: Client,
    base_url: Url,
}

impl IssuanceClient {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(server_url)
            .map_err(|e| PqcertError::server("parse server URL", format!("{server_url}: {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pqcert/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PqcertError::server("build HTTP client", e))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PqcertError::server("build request URL", e))
    }

    /// Ask the server for a challenge
    pub async fn request(&self, request: &CertificateRequest) -> Result<ChallengeResponse> {
        let response = self
            .http
            .post(self.endpoint(REQUEST_PATH)?)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PqcertError::server("request certificate", e))?;

        response
            .json()
            .await
            .map_err(|e| PqcertError::server("decode challenge", e))
    }

    /// Ask the server to check the published token
    pub async fn verify(&self, challenge_id: &ChallengeId) -> Result<VerifyResponse> {
        let url = self.endpoint(&format!("{}{}", VERIFY_PATH_PREFIX, challenge_id))?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PqcertError::server("verify challenge", e))?;

        response
            .json()
            .await
            .map_err(|e| PqcertError::server("decode verification result", e))
    }

    /// Bytes of one artifact of an issued certificate
    pub async fn download(&self, id: &CertificateId, filename: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.endpoint(&artifact_url(id, filename))?)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PqcertError::server("download artifact", e))?;

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PqcertError::server("read artifact", e))
    }
}

/// What `pqcert get` recorded about a downloaded certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub certificate_id: CertificateId,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub cert_dir: PathBuf,
}

impl DownloadMetadata {
    /// Whether the certificate expires within `threshold_days` of `now`;
    /// unknown expiry counts as due
    pub fn is_due_at(&self, threshold_days: u32, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                expires_at <= now + chrono::Duration::days(i64::from(threshold_days))
            }
            None => true,
        }
    }
}

/// Token file under the web root, removed on drop
struct PublishedToken {
    path: PathBuf,
}

impl Drop for PublishedToken {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed challenge token"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Could not remove challenge token"),
        }
    }
}

/// Runs the request → publish → verify → download flow
#[derive(Debug, Clone)]
pub struct CertificateFetcher {
    client: IssuanceClient,
    webroot: PathBuf,
    certs_dir: PathBuf,
    publish_delay: Duration,
}

impl CertificateFetcher {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client: IssuanceClient::new(
                &config.server_url,
                Duration::from_secs(config.timeout_secs),
            )?,
            webroot: config.webroot.clone(),
            certs_dir: config.certs_dir.clone(),
            publish_delay: Duration::from_secs(config.publish_delay_secs),
        })
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Obtain a certificate for `domain` and store it under the certs dir
    pub async fn fetch(
        &self,
        domain: &str,
        algorithm: Option<Algorithm>,
        email: Option<String>,
    ) -> Result<DownloadMetadata> {
        // The domain names a directory below certs_dir
        validate_domain(domain)?;

        let challenge = self
            .client
            .request(&CertificateRequest {
                domain: domain.to_string(),
                email: email.clone(),
                algorithm,
            })
            .await?;
        info!(
            domain = %domain,
            challenge_id = %challenge.challenge_id,
            expires_at = %challenge.expires_at,
            "Challenge received"
        );

        let outcome = {
            let _token = self.publish(&challenge)?;
            if !self.publish_delay.is_zero() {
                tokio::time::sleep(self.publish_delay).await;
            }
            self.client.verify(&challenge.challenge_id).await?
        };

        if !outcome.success {
            return Err(PqcertError::ValidationFailed {
                domain: domain.to_string(),
            });
        }
        let certificate_id = outcome
            .certificate_id
            .clone()
            .ok_or_else(|| {
                PqcertError::server("verify challenge", "response lacks a certificate id")
            })?;
        info!(domain = %domain, cert_id = %certificate_id, "Domain verified");

        let cert_dir = self.certs_dir.join(domain);
        create_private_dir(&self.certs_dir)?;
        create_private_dir(&cert_dir)?;

        for filename in DOWNLOADABLE_ARTIFACTS {
            let bytes = self.client.download(&certificate_id, filename).await?;
            let mode = if *filename == "key.pem" { 0o600 } else { 0o644 };
            write_atomic(&cert_dir.join(filename), &bytes, mode)?;
            debug!(domain = %domain, artifact = %filename, bytes = bytes.len(), "Saved artifact");
        }

        let metadata = DownloadMetadata {
            domain: domain.to_string(),
            algorithm,
            email,
            certificate_id,
            issued_at: Utc::now(),
            expires_at: outcome.expires_at,
            cert_dir: cert_dir.clone(),
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(StorageError::from)?;
        write_atomic(&cert_dir.join(METADATA_FILE), &json, 0o644)?;

        info!(
            domain = %domain,
            dir = %cert_dir.display(),
            "Certificate downloaded"
        );
        Ok(metadata)
    }

    /// Write the challenge token where the server will look for it
    fn publish(&self, challenge: &ChallengeResponse) -> Result<PublishedToken> {
        let path = token_path(&self.webroot, challenge)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        }
        fs::write(&path, challenge.challenge_token.as_bytes())
            .map_err(|e| StorageError::io(&path, e))?;
        info!(path = %path.display(), "Published challenge token");
        Ok(PublishedToken { path })
    }

    /// Metadata of every certificate downloaded so far
    ///
    /// Directories without readable metadata are skipped.
    pub fn downloaded(&self) -> Result<Vec<DownloadMetadata>> {
        let entries = match fs::read_dir(&self.certs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.certs_dir, e).into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.certs_dir, e))?;
            let path = entry.path().join(METADATA_FILE);
            let Ok(content) = fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<DownloadMetadata>(&content) {
                Ok(metadata) => found.push(metadata),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable metadata"),
            }
        }
        found.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(found)
    }

    /// Downloaded certificates expiring within `threshold_days`
    pub fn due_for_renewal(&self, threshold_days: u32) -> Result<Vec<DownloadMetadata>> {
        let now = Utc::now();
        Ok(self
            .downloaded()?
            .into_iter()
            .filter(|m| m.is_due_at(threshold_days, now))
            .collect())
    }
}

/// File for the token: the challenge URL's path below `webroot`
fn token_path(webroot: &Path, challenge: &ChallengeResponse) -> Result<PathBuf> {
    let url = Url::parse(&challenge.challenge_url)
        .map_err(|e| PqcertError::server("parse challenge URL", e))?;
    let relative = Path::new(url.path().trim_start_matches('/'));

    let confined = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    let names_token = relative
        .file_name()
        .is_some_and(|name| name == challenge.challenge_token.as_str());
    if !confined || !names_token {
        return Err(PqcertError::server(
            "parse challenge URL",
            format!("unexpected challenge path {:?}", url.path()),
        ));
    }
    Ok(webroot.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const DOMAIN: &str = "example.test";
    const TOKEN: &str = "dG9rZW4tZm9yLWNsaWVudC10ZXN0cw";

    struct Setup {
        _temp: TempDir,
        server: MockServer,
        fetcher: CertificateFetcher,
        webroot: PathBuf,
        certs_dir: PathBuf,
    }

    async fn setup() -> Setup {
        let temp = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let webroot = temp.path().join("www");
        let certs_dir = temp.path().join("domains");
        let config = ClientConfig {
            server_url: server.uri(),
            webroot: webroot.clone(),
            certs_dir: certs_dir.clone(),
            timeout_secs: 5,
            publish_delay_secs: 0,
        };
        Setup {
            fetcher: CertificateFetcher::new(&config).unwrap(),
            _temp: temp,
            server,
            webroot,
            certs_dir,
        }
    }

    fn token_file(webroot: &Path) -> PathBuf {
        webroot.join(".well-known/pqcert-challenge").join(TOKEN)
    }

    async fn mount_request(server: &MockServer, challenge_id: &ChallengeId) {
        let challenge = ChallengeResponse {
            challenge_id: challenge_id.clone(),
            challenge_token: TOKEN.to_string(),
            challenge_url: format!("http://{}/.well-known/pqcert-challenge/{}", DOMAIN, TOKEN),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        Mock::given(method("POST"))
            .and(path(REQUEST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&challenge))
            .mount(server)
            .await;
    }

    /// Succeeds only while the token file holds the token
    struct TokenOnDisk {
        file: PathBuf,
        cert_id: CertificateId,
        calls: Arc<AtomicUsize>,
    }

    impl Respond for TokenOnDisk {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let published = fs::read_to_string(&self.file).is_ok_and(|body| body == TOKEN);
            let body = if published {
                VerifyResponse {
                    success: true,
                    certificate_id: Some(self.cert_id.clone()),
                    cert_url: Some(artifact_url(&self.cert_id, "cert.pem")),
                    key_url: Some(artifact_url(&self.cert_id, "key.pem")),
                    chain_url: Some(artifact_url(&self.cert_id, "chain.pem")),
                    expires_at: Some(Utc::now() + chrono::Duration::days(90)),
                }
            } else {
                VerifyResponse::failed()
            };
            ResponseTemplate::new(200).set_body_json(body)
        }
    }

    async fn mount_artifacts(server: &MockServer, cert_id: &CertificateId) {
        for filename in DOWNLOADABLE_ARTIFACTS {
            Mock::given(method("GET"))
                .and(path(artifact_url(cert_id, filename)))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!("{filename} body")))
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn test_fetch_publishes_verifies_and_downloads() {
        let s = setup().await;
        let challenge_id = ChallengeId::new();
        let cert_id = CertificateId::new();
        let calls = Arc::new(AtomicUsize::new(0));
        mount_request(&s.server, &challenge_id).await;
        Mock::given(method("POST"))
            .and(path(format!("{}{}", VERIFY_PATH_PREFIX, challenge_id)))
            .respond_with(TokenOnDisk {
                file: token_file(&s.webroot),
                cert_id: cert_id.clone(),
                calls: Arc::clone(&calls),
            })
            .mount(&s.server)
            .await;
        mount_artifacts(&s.server, &cert_id).await;

        let metadata = s
            .fetcher
            .fetch(DOMAIN, Some(Algorithm::Hybrid), Some("ops@example.test".to_string()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metadata.certificate_id, cert_id);
        assert_eq!(metadata.algorithm, Some(Algorithm::Hybrid));
        assert!(metadata.expires_at.is_some());

        let dir = s.certs_dir.join(DOMAIN);
        assert_eq!(metadata.cert_dir, dir);
        for filename in DOWNLOADABLE_ARTIFACTS {
            assert_eq!(
                fs::read_to_string(dir.join(filename)).unwrap(),
                format!("{filename} body")
            );
        }
        let saved: DownloadMetadata =
            serde_json::from_slice(&fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(saved, metadata);

        // Token is cleaned up after verification
        assert!(!token_file(&s.webroot).exists());

        // The request body carries the domain and algorithm
        let requests = s.server.received_requests().await.unwrap();
        let body: CertificateRequest = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.domain, DOMAIN);
        assert_eq!(body.algorithm, Some(Algorithm::Hybrid));

        assert_eq!(s.fetcher.downloaded().unwrap(), vec![metadata]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let s = setup().await;
        let challenge_id = ChallengeId::new();
        let cert_id = CertificateId::new();
        mount_request(&s.server, &challenge_id).await;
        Mock::given(method("POST"))
            .and(path(format!("{}{}", VERIFY_PATH_PREFIX, challenge_id)))
            .respond_with(TokenOnDisk {
                file: token_file(&s.webroot),
                cert_id: cert_id.clone(),
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .mount(&s.server)
            .await;
        mount_artifacts(&s.server, &cert_id).await;

        s.fetcher.fetch(DOMAIN, None, None).await.unwrap();

        let mode = |name: &str| {
            fs::metadata(s.certs_dir.join(DOMAIN).join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("key.pem"), 0o600);
        assert_eq!(mode("cert.pem"), 0o644);
        assert_eq!(mode("fullchain.pem"), 0o644);
    }

    #[tokio::test]
    async fn test_failed_verification_cleans_up() {
        let s = setup().await;
        let challenge_id = ChallengeId::new();
        mount_request(&s.server, &challenge_id).await;
        Mock::given(method("POST"))
            .and(path_regex("^/v1/certificate/verify/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(VerifyResponse::failed()))
            .mount(&s.server)
            .await;

        let err = s.fetcher.fetch(DOMAIN, None, None).await.unwrap_err();
        assert!(matches!(err, PqcertError::ValidationFailed { .. }));
        assert!(!token_file(&s.webroot).exists());
        assert!(!s.certs_dir.join(DOMAIN).exists());
    }

    #[tokio::test]
    async fn test_invalid_domain_never_reaches_server() {
        let s = setup().await;
        for domain in ["../etc", "exa mple.com", "localhost"] {
            assert!(matches!(
                s.fetcher.fetch(domain, None, None).await.unwrap_err(),
                PqcertError::InvalidDomain(_)
            ));
        }
        assert!(s.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let s = setup().await;
        Mock::given(method("POST"))
            .and(path(REQUEST_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&s.server)
            .await;

        let err = s.fetcher.fetch(DOMAIN, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            PqcertError::ServerRequestFailed {
                operation: "request certificate",
                ..
            }
        ));
    }

    #[test]
    fn test_token_path_stays_under_webroot() {
        let webroot = Path::new("/srv/www");
        let challenge = |url: &str| ChallengeResponse {
            challenge_id: ChallengeId::new(),
            challenge_token: TOKEN.to_string(),
            challenge_url: url.to_string(),
            expires_at: Utc::now(),
        };

        let ok = challenge(&format!("http://{DOMAIN}/.well-known/pqcert-challenge/{TOKEN}"));
        assert_eq!(
            token_path(webroot, &ok).unwrap(),
            PathBuf::from(format!("/srv/www/.well-known/pqcert-challenge/{TOKEN}"))
        );

        for bad in [
            format!("http://{DOMAIN}/.well-known/../../etc/{TOKEN}"),
            format!("http://{DOMAIN}/.well-known/pqcert-challenge/other"),
            "not a url".to_string(),
        ] {
            assert!(token_path(webroot, &challenge(&bad)).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_due_for_renewal() {
        let now = Utc::now();
        let metadata = |days: Option<i64>| DownloadMetadata {
            domain: DOMAIN.to_string(),
            algorithm: None,
            email: None,
            certificate_id: CertificateId::new(),
            issued_at: now,
            expires_at: days.map(|d| now + chrono::Duration::days(d)),
            cert_dir: PathBuf::from("/tmp"),
        };
        assert!(metadata(Some(10)).is_due_at(30, now));
        assert!(!metadata(Some(60)).is_due_at(30, now));
        assert!(metadata(None).is_due_at(30, now));
    }

    #[tokio::test]
    async fn test_downloaded_skips_unreadable_metadata() {
        let s = setup().await;
        assert!(s.fetcher.downloaded().unwrap().is_empty());

        let broken = s.certs_dir.join("broken.test");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(METADATA_FILE), b"{").unwrap();
        fs::create_dir_all(s.certs_dir.join("empty.test")).unwrap();

        assert!(s.fetcher.downloaded().unwrap().is_empty());
    }
}
