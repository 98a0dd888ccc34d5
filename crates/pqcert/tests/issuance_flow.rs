//! End-to-end issuance: request, publish token, verify, download, renew.
//!
//! The validator is pointed at a local mock server for `example.test`, so the
//! full HTTP check runs without DNS.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use pqcert::ca::LocalAuthority;
use pqcert::{
    Algorithm, CertificateRequest, CertificateService, ChallengeManager, ChallengeResponse,
    DomainIssuer, DomainValidator, FsStore, PqcertError, RecordOrigin, RecordStore,
};
use pqcert_config::{LocalCaConfig, ValidatorConfig};

const DOMAIN: &str = "example.test";

struct Harness {
    _temp: TempDir,
    server: MockServer,
    service: CertificateService,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let store = Arc::new(FsStore::new(&temp.path().join("data")).unwrap());
    let validator = DomainValidator::with_resolved(
        &ValidatorConfig {
            timeout_secs: 5,
            max_body_bytes: 65536,
        },
        [(DOMAIN.to_string(), *server.address())],
    )
    .unwrap();
    let local = LocalAuthority::new(LocalCaConfig {
        base_dir: temp.path().join("local"),
        ..LocalCaConfig::default()
    });

    let service = CertificateService::new(
        ChallengeManager::new(store.clone()),
        validator,
        DomainIssuer::default(),
        RecordStore::new(store),
    )
    .with_local_authority(Arc::new(local))
    .with_default_algorithm(Algorithm::Rsa);

    Harness {
        _temp: temp,
        server,
        service,
    }
}

fn request(domain: &str, algorithm: Option<Algorithm>) -> CertificateRequest {
    CertificateRequest {
        domain: domain.to_string(),
        email: Some("ops@example.test".to_string()),
        algorithm,
    }
}

async fn publish(server: &MockServer, challenge: &ChallengeResponse) {
    let url = url::Url::parse(&challenge.challenge_url).unwrap();
    Mock::given(method("GET"))
        .and(path(url.path()))
        .respond_with(ResponseTemplate::new(200).set_body_string(&challenge.challenge_token))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_request_verify_download() {
    let h = harness().await;

    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    assert_eq!(
        challenge.challenge_url,
        format!(
            "http://{}/.well-known/pqcert-challenge/{}",
            DOMAIN, challenge.challenge_token
        )
    );
    publish(&h.server, &challenge).await;

    let outcome = h.service.verify(&challenge.challenge_id).await.unwrap();
    assert!(outcome.success);
    let cert_id = outcome.certificate_id.clone().unwrap();
    assert_eq!(
        outcome.cert_url.as_deref(),
        Some(format!("/v1/certificate/{}/cert.pem", cert_id).as_str())
    );

    let cert_pem = h.service.download(cert_id.as_str(), "cert.pem").unwrap();
    let (_, pem) = parse_x509_pem(&cert_pem).unwrap();
    let cert = pem.parse_x509().unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    let names: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(*dns),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec![DOMAIN]);
    assert_eq!(san.value.general_names.len(), 1);
    let validity = cert.validity();
    assert_eq!(
        validity.not_after.timestamp() - validity.not_before.timestamp(),
        90 * 86400
    );

    let key = h.service.download(cert_id.as_str(), "key.pem").unwrap();
    assert!(String::from_utf8(key).unwrap().contains("PRIVATE KEY"));
    assert!(h.service.download(cert_id.as_str(), "chain.pem").unwrap().is_empty());
    assert_eq!(
        h.service.download(cert_id.as_str(), "fullchain.pem").unwrap(),
        cert_pem
    );

    // Challenge is single-use
    assert!(matches!(
        h.service.verify(&challenge.challenge_id).await.unwrap_err(),
        PqcertError::ChallengeNotFound(_)
    ));
}

#[tokio::test]
async fn test_download_rejects_unknown_names() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    publish(&h.server, &challenge).await;
    let cert_id = h
        .service
        .verify(&challenge.challenge_id)
        .await
        .unwrap()
        .certificate_id
        .unwrap();

    for name in ["../key.pem", "cert.der", "", "KEY.PEM"] {
        assert!(matches!(
            h.service.download(cert_id.as_str(), name).unwrap_err(),
            PqcertError::InvalidArtifact(_)
        ));
    }
    assert!(matches!(
        h.service.download("not-a-uuid", "cert.pem").unwrap_err(),
        PqcertError::CertificateNotFound(_)
    ));
}

#[tokio::test]
async fn test_failed_validation_can_be_retried() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();

    // Token not published yet
    let outcome = h.service.verify(&challenge.challenge_id).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.certificate_id.is_none());
    assert_eq!(h.service.challenges().pending_count().unwrap(), 1);

    publish(&h.server, &challenge).await;
    let outcome = h.service.verify(&challenge.challenge_id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(h.service.challenges().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_wrong_token_fails() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    let url = url::Url::parse(&challenge.challenge_url).unwrap();
    Mock::given(method("GET"))
        .and(path(url.path()))
        .respond_with(ResponseTemplate::new(200).set_body_string("something else"))
        .mount(&h.server)
        .await;

    let outcome = h.service.verify(&challenge.challenge_id).await.unwrap();
    assert!(!outcome.success);
    assert!(h.service.records().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_verification_is_rejected() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    let url = url::Url::parse(&challenge.challenge_url).unwrap();
    Mock::given(method("GET"))
        .and(path(url.path()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(&challenge.challenge_token)
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&h.server)
        .await;

    let (first, second) = tokio::join!(
        h.service.verify(&challenge.challenge_id),
        h.service.verify(&challenge.challenge_id)
    );
    assert!(first.unwrap().success);
    assert!(matches!(
        second.unwrap_err(),
        PqcertError::ChallengeInProgress(_)
    ));
    assert_eq!(h.service.records().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_domain_rejected_at_request() {
    let h = harness().await;
    for domain in ["localhost", "-bad.example.com", "exa mple.com", "example.123"] {
        assert!(matches!(
            h.service.request(request(domain, None)).unwrap_err(),
            PqcertError::InvalidDomain(_)
        ));
    }
}

#[tokio::test]
async fn test_requested_algorithm_is_used() {
    let h = harness().await;
    let challenge = h
        .service
        .request(request(DOMAIN, Some(Algorithm::MlDsa)))
        .unwrap();
    publish(&h.server, &challenge).await;

    let cert_id = h
        .service
        .verify(&challenge.challenge_id)
        .await
        .unwrap()
        .certificate_id
        .unwrap();
    let record = h.service.records().load(&cert_id).unwrap();
    assert_eq!(record.algorithm, Algorithm::MlDsa);
    assert_eq!(record.origin, RecordOrigin::DomainValidated);
}

#[tokio::test]
async fn test_renewal_creates_new_record() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    publish(&h.server, &challenge).await;
    let old_id = h
        .service
        .verify(&challenge.challenge_id)
        .await
        .unwrap()
        .certificate_id
        .unwrap();

    // Nothing is due within 30 days of a fresh 90-day certificate
    assert!(h.service.renew_expiring(30).await.unwrap().is_empty());

    let report = h.service.renew_expiring(120).await.unwrap();
    assert_eq!(report.renewed.len(), 1);
    assert!(report.failed.is_empty());
    let (replaced, new_id) = &report.renewed[0];
    assert_eq!(replaced, &old_id);

    let old = h.service.records().load(&old_id).unwrap();
    let new = h.service.records().load(new_id).unwrap();
    assert_eq!(new.domain, old.domain);
    assert_eq!(new.algorithm, old.algorithm);
    assert_eq!(new.renewed_from.as_ref(), Some(&old_id));
    assert_ne!(new.serial, old.serial);
    assert_eq!(h.service.records().list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_renewed_certificate_downloadable_by_original_id() {
    let h = harness().await;
    let challenge = h.service.request(request(DOMAIN, None)).unwrap();
    publish(&h.server, &challenge).await;
    let old_id = h
        .service
        .verify(&challenge.challenge_id)
        .await
        .unwrap()
        .certificate_id
        .unwrap();
    let old_pem = h.service.download(old_id.as_str(), "cert.pem").unwrap();

    let report = h.service.renew_expiring(120).await.unwrap();
    let new_id = report.renewed[0].1.clone();
    let new_record = h.service.records().load(&new_id).unwrap();

    // The id the requester holds now serves the renewal
    let served = h.service.download(old_id.as_str(), "cert.pem").unwrap();
    assert_ne!(served, old_pem);
    assert_eq!(served, new_record.leaf_cert.as_bytes());
    assert_eq!(
        h.service.download(old_id.as_str(), "key.pem").unwrap(),
        new_record.leaf_key.as_bytes()
    );
    assert_eq!(h.service.download(new_id.as_str(), "cert.pem").unwrap(), served);

    // A second renewal is followed as well
    let report = h.service.renew_expiring(120).await.unwrap();
    assert_eq!(report.renewed.len(), 1);
    assert_eq!(report.renewed[0].0, new_id);
    let newest = h.service.records().load(&report.renewed[0].1).unwrap();
    assert_eq!(
        h.service.download(old_id.as_str(), "fullchain.pem").unwrap(),
        newest.fullchain.as_bytes()
    );
}

#[tokio::test]
async fn test_local_certificate_recorded_and_renewed() {
    let h = harness().await;
    let (leaf, record) = h
        .service
        .issue_local("localhost", vec!["myapp.test".to_string()])
        .await
        .unwrap();

    assert_eq!(record.origin, RecordOrigin::LocalCa);
    assert!(leaf.subject_alt_names.contains(&"myapp.test".to_string()));
    assert!(leaf.paths.pfx.exists());

    let fullchain = h
        .service
        .download(record.id.as_str(), "fullchain.pem")
        .unwrap();
    assert_eq!(
        String::from_utf8(fullchain)
            .unwrap()
            .matches("BEGIN CERTIFICATE")
            .count(),
        2
    );

    // 825-day local leaves fall inside a 1000-day window
    let report = h.service.renew_expiring(1000).await.unwrap();
    assert_eq!(report.renewed.len(), 1);
    let renewed = h.service.records().load(&report.renewed[0].1).unwrap();
    assert_eq!(renewed.origin, RecordOrigin::LocalCa);
    assert_eq!(renewed.subject_alt_names, record.subject_alt_names);
    assert_eq!(renewed.serial, "02");
}
