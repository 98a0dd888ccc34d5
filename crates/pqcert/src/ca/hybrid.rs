//! Dual-signature (classical + ML-DSA) certificates
//!
//! The certificate is an ordinary RSA-signed X.509 leaf whose TBS also
//! carries the X.509 alternative-key extensions:
//!
//! | OID        | Extension                  | Value                               |
//! |------------|----------------------------|-------------------------------------|
//! | 2.5.29.72  | subjectAltPublicKeyInfo    | ML-DSA-65 SubjectPublicKeyInfo      |
//! | 2.5.29.73  | altSignatureAlgorithm      | id-ml-dsa-65                        |
//! | 2.5.29.74  | altSignatureValue          | ML-DSA-65 signature (BIT STRING)    |
//!
//! The alternative signature covers the PreTBSCertificate: the DER
//! TBSCertificate with its `signature` AlgorithmIdentifier and the
//! altSignatureValue extension removed. Relying parties that understand the
//! extensions must check both signatures ([`verify_hybrid`]); legacy parties
//! see a plain RSA certificate.

use aws_lc_rs::signature::{UnparsedPublicKey, ML_DSA_65};
use der::asn1::BitString;
use der::{Any, Decode, Encode, Tag, TagNumber, Tagged};
use openssl::x509::X509;
use rcgen::{Certificate, CertificateParams, CustomExtension};
use spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoRef};
use tracing::{debug, trace};
use x509_parser::certificate::X509Certificate;
use x509_parser::oid_registry::Oid;

use super::crypto::{KeyKind, KeyMaterial};
use crate::error::{PqcertError, Result};

pub const SUBJECT_ALT_PUBLIC_KEY_INFO: &[u64] = &[2, 5, 29, 72];
pub const ALT_SIGNATURE_ALGORITHM: &[u64] = &[2, 5, 29, 73];
pub const ALT_SIGNATURE_VALUE: &[u64] = &[2, 5, 29, 74];

/// id-ml-dsa-65 (NIST CSOR)
pub const ID_ML_DSA_65: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.18");

const ALT_SIGNATURE_VALUE_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.74");

/// Output of a hybrid signing operation
pub struct HybridCertificate {
    pub certificate: Certificate,
    pub classical_key: KeyMaterial,
    pub post_quantum_key: KeyMaterial,
}

/// Sign `params` with a fresh RSA-2048 key and attach an ML-DSA-65
/// alternative key and signature
///
/// `params` must carry a fixed serial number and validity window so that the
/// pre-certificate and the final certificate share a TBS prefix.
pub fn sign_hybrid(params: CertificateParams) -> Result<HybridCertificate> {
    let classical_key = KeyMaterial::generate(KeyKind::Rsa2048)?;
    let post_quantum_key = KeyMaterial::generate(KeyKind::MlDsa65)?;

    let mut params = params;
    params.custom_extensions.push(CustomExtension::from_oid_content(
        SUBJECT_ALT_PUBLIC_KEY_INFO,
        post_quantum_key.public_key_info(),
    ));
    params.custom_extensions.push(CustomExtension::from_oid_content(
        ALT_SIGNATURE_ALGORITHM,
        alt_signature_algorithm()?,
    ));

    let pre_tbs = pre_tbs_certificate(&pre_certificate_tbs(&params, &classical_key)?)?;
    let alt_signature = post_quantum_key.sign(&pre_tbs)?;
    trace!(
        tbs_len = pre_tbs.len(),
        signature_len = alt_signature.len(),
        "Computed alternative signature"
    );

    let value = BitString::from_bytes(&alt_signature)
        .and_then(|bits| bits.to_der())
        .map_err(|e| PqcertError::crypto("encode alternative signature", e))?;
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(ALT_SIGNATURE_VALUE, value));

    let certificate = params
        .self_signed(classical_key.key_pair())
        .map_err(|e| PqcertError::crypto("sign certificate", e))?;

    Ok(HybridCertificate {
        certificate,
        classical_key,
        post_quantum_key,
    })
}

/// DER AlgorithmIdentifier for ML-DSA-65 (parameters absent)
fn alt_signature_algorithm() -> Result<Vec<u8>> {
    AlgorithmIdentifierOwned {
        oid: ID_ML_DSA_65,
        parameters: None,
    }
    .to_der()
    .map_err(|e| PqcertError::crypto("encode alternative algorithm", e))
}

/// TBSCertificate of the certificate `params` would produce right now
fn pre_certificate_tbs(params: &CertificateParams, key: &KeyMaterial) -> Result<Vec<u8>> {
    let pre = params
        .clone()
        .self_signed(key.key_pair())
        .map_err(|e| PqcertError::crypto("sign pre-certificate", e))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(pre.der())
        .map_err(|e| PqcertError::crypto("parse pre-certificate", e))?;
    Ok(parsed.tbs_certificate.as_ref().to_vec())
}

/// PreTBSCertificate for a DER TBSCertificate: the same SEQUENCE without the
/// `signature` field and without any altSignatureValue extension
pub fn pre_tbs_certificate(tbs: &[u8]) -> Result<Vec<u8>> {
    let encoding = |e: der::Error| PqcertError::crypto("rebuild PreTBSCertificate", e);

    let mut fields = <Vec<Any> as Decode>::from_der(tbs).map_err(encoding)?;
    let explicit_version = fields
        .first()
        .is_some_and(|field| field.tag() == context_tag(TagNumber::N0));
    // version?, serialNumber, signature, ...
    let signature_index = if explicit_version { 2 } else { 1 };
    if fields.len() <= signature_index {
        return Err(PqcertError::crypto(
            "rebuild PreTBSCertificate",
            "truncated TBSCertificate",
        ));
    }
    fields.remove(signature_index);

    let extensions_tag = context_tag(TagNumber::N3);
    if let Some(slot) = fields.iter_mut().find(|f| f.tag() == extensions_tag) {
        let mut extensions = <Vec<Any> as Decode>::from_der(slot.value()).map_err(encoding)?;
        extensions.retain(|ext| extension_oid(ext).ok() != Some(ALT_SIGNATURE_VALUE_OID));
        let inner = extensions.to_der().map_err(encoding)?;
        *slot = Any::new(extensions_tag, inner).map_err(encoding)?;
    }

    fields.to_der().map_err(encoding)
}

fn context_tag(number: TagNumber) -> Tag {
    Tag::ContextSpecific {
        constructed: true,
        number,
    }
}

fn extension_oid(extension: &Any) -> der::Result<ObjectIdentifier> {
    let parts: Vec<Any> = extension.decode_as()?;
    parts
        .first()
        .ok_or_else(|| der::Tag::ObjectIdentifier.value_error())?
        .decode_as()
}

/// Check both signatures of a self-signed hybrid certificate
///
/// The RSA signature is verified with the certificate's own key, the
/// ML-DSA-65 alternative signature with the key in subjectAltPublicKeyInfo
/// over the PreTBSCertificate rebuilt from the final TBS. Returns `false`
/// when either check fails or an alternative-key extension is missing.
pub fn verify_hybrid(cert_der: &[u8]) -> Result<bool> {
    let classical = X509::from_der(cert_der)
        .and_then(|x509| {
            let key = x509.public_key()?;
            x509.verify(&key)
        })
        .map_err(|e| PqcertError::crypto("verify classical signature", e))?;
    if !classical {
        debug!("Classical signature does not verify");
        return Ok(false);
    }

    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| PqcertError::crypto("parse hybrid certificate", e))?;
    let (Some(alt_spki), Some(alt_algorithm), Some(alt_value)) = (
        find_extension(&cert, SUBJECT_ALT_PUBLIC_KEY_INFO),
        find_extension(&cert, ALT_SIGNATURE_ALGORITHM),
        find_extension(&cert, ALT_SIGNATURE_VALUE),
    ) else {
        debug!("Certificate lacks alternative-key extensions");
        return Ok(false);
    };

    if alt_algorithm != alt_signature_algorithm()?.as_slice() {
        debug!("Unsupported alternative signature algorithm");
        return Ok(false);
    }
    let spki = <SubjectPublicKeyInfoRef<'_> as Decode>::from_der(alt_spki)
        .map_err(|e| PqcertError::crypto("parse alternative public key", e))?;
    let signature = <BitString as Decode>::from_der(alt_value)
        .map_err(|e| PqcertError::crypto("parse alternative signature", e))?;

    let pre_tbs = pre_tbs_certificate(cert.tbs_certificate.as_ref())?;
    let key = UnparsedPublicKey::new(&ML_DSA_65, spki.subject_public_key.raw_bytes());
    let valid = key.verify(&pre_tbs, signature.raw_bytes()).is_ok();
    if !valid {
        debug!("Alternative signature does not verify");
    }
    Ok(valid)
}

fn find_extension<'a>(cert: &X509Certificate<'a>, oid: &[u64]) -> Option<&'a [u8]> {
    let oid = Oid::from(oid).ok()?;
    cert.extensions()
        .iter()
        .find(|ext| ext.oid == oid)
        .map(|ext| ext.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::profile::{now_seconds, random_serial, LeafProfile};
    use der::asn1::BitString;
    use x509_parser::oid_registry::Oid;
    use x509_parser::prelude::*;

    fn params() -> CertificateParams {
        LeafProfile::for_domain("example.com", 90)
            .to_params(KeyKind::Rsa2048, random_serial(), now_seconds())
            .unwrap()
    }

    fn extension<'a>(cert: &'a X509Certificate<'a>, oid: &[u64]) -> Option<&'a [u8]> {
        let oid = Oid::from(oid).unwrap();
        cert.extensions()
            .iter()
            .find(|ext| ext.oid == oid)
            .map(|ext| ext.value)
    }

    #[test]
    fn test_algorithm_identifier_encoding() {
        assert_eq!(
            alt_signature_algorithm().unwrap(),
            vec![
                0x30, 0x0b, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x03, 0x12
            ]
        );
    }

    #[test]
    fn test_hybrid_certificate_carries_both_keys() {
        let hybrid = sign_hybrid(params()).unwrap();
        let (_, cert) = X509Certificate::from_der(hybrid.certificate.der()).unwrap();

        // Classical signature is RSA
        assert_eq!(
            cert.signature_algorithm.algorithm,
            x509_parser::oid_registry::OID_PKCS1_SHA256WITHRSA
        );

        let alt_spki = extension(&cert, SUBJECT_ALT_PUBLIC_KEY_INFO).unwrap();
        assert_eq!(alt_spki, hybrid.post_quantum_key.public_key_info().as_slice());
        let (_, spki) = SubjectPublicKeyInfo::from_der(alt_spki).unwrap();
        assert_eq!(spki.algorithm.algorithm.to_id_string(), "2.16.840.1.101.3.4.3.18");

        let alt_alg = extension(&cert, ALT_SIGNATURE_ALGORITHM).unwrap();
        assert_eq!(alt_alg, alt_signature_algorithm().unwrap().as_slice());

        let alt_value = extension(&cert, ALT_SIGNATURE_VALUE).unwrap();
        let bits = <BitString as der::Decode>::from_der(alt_value).unwrap();
        assert_eq!(bits.raw_bytes().len(), 3309);
    }

    #[test]
    fn test_pre_certificate_is_deterministic() {
        let params = params();
        let key = KeyMaterial::generate(KeyKind::Rsa2048).unwrap();
        let a = pre_certificate_tbs(&params, &key).unwrap();
        let b = pre_certificate_tbs(&params, &key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_final_tbs_extends_pre_certificate() {
        let base = params();
        let hybrid = sign_hybrid(base.clone()).unwrap();

        let mut pre_params = base;
        pre_params.custom_extensions.push(CustomExtension::from_oid_content(
            SUBJECT_ALT_PUBLIC_KEY_INFO,
            hybrid.post_quantum_key.public_key_info(),
        ));
        pre_params.custom_extensions.push(CustomExtension::from_oid_content(
            ALT_SIGNATURE_ALGORITHM,
            alt_signature_algorithm().unwrap(),
        ));
        let pre = pre_certificate_tbs(&pre_params, &hybrid.classical_key).unwrap();

        let (_, final_cert) = X509Certificate::from_der(hybrid.certificate.der()).unwrap();
        let final_tbs = final_cert.tbs_certificate.as_ref();
        assert!(final_tbs.len() > pre.len());
        let pre_ext_count = {
            let (_, c) = TbsCertificate::from_der(&pre).unwrap();
            c.extensions().len()
        };
        assert_eq!(final_cert.extensions().len(), pre_ext_count + 1);
    }

    fn with_alt_signature(
        base: CertificateParams,
        hybrid: &HybridCertificate,
        alt_signature: &[u8],
    ) -> Vec<u8> {
        let mut params = base;
        params.custom_extensions.push(CustomExtension::from_oid_content(
            SUBJECT_ALT_PUBLIC_KEY_INFO,
            hybrid.post_quantum_key.public_key_info(),
        ));
        params.custom_extensions.push(CustomExtension::from_oid_content(
            ALT_SIGNATURE_ALGORITHM,
            alt_signature_algorithm().unwrap(),
        ));
        params.custom_extensions.push(CustomExtension::from_oid_content(
            ALT_SIGNATURE_VALUE,
            BitString::from_bytes(alt_signature).unwrap().to_der().unwrap(),
        ));
        params
            .self_signed(hybrid.classical_key.key_pair())
            .unwrap()
            .der()
            .to_vec()
    }

    fn alt_signature_of(cert_der: &[u8]) -> Vec<u8> {
        let (_, cert) = X509Certificate::from_der(cert_der).unwrap();
        let value = extension(&cert, ALT_SIGNATURE_VALUE).unwrap();
        <BitString as der::Decode>::from_der(value)
            .unwrap()
            .raw_bytes()
            .to_vec()
    }

    #[test]
    fn test_hybrid_certificate_verifies() {
        let hybrid = sign_hybrid(params()).unwrap();
        assert!(verify_hybrid(hybrid.certificate.der()).unwrap());
    }

    #[test]
    fn test_pre_tbs_drops_signature_field_and_alt_value() {
        let hybrid = sign_hybrid(params()).unwrap();
        let (_, parsed) = X509Certificate::from_der(hybrid.certificate.der()).unwrap();
        let tbs = parsed.tbs_certificate.as_ref();

        let full = <Vec<der::Any> as der::Decode>::from_der(tbs).unwrap();
        let pre = pre_tbs_certificate(tbs).unwrap();
        let pre_fields = <Vec<der::Any> as der::Decode>::from_der(&pre).unwrap();
        assert_eq!(pre_fields.len(), full.len() - 1);

        // serialNumber is followed directly by issuer
        assert_eq!(pre_fields[1].tag(), der::Tag::Integer);
        assert_eq!(pre_fields[2], full[3]);

        let extensions_tag = context_tag(TagNumber::N3);
        let count = |fields: &[der::Any]| {
            let slot = fields.iter().find(|f| f.tag() == extensions_tag).unwrap();
            <Vec<der::Any> as der::Decode>::from_der(slot.value()).unwrap().len()
        };
        assert_eq!(count(&pre_fields), count(&full) - 1);
    }

    #[test]
    fn test_tampered_alt_signature_fails() {
        let base = params();
        let hybrid = sign_hybrid(base.clone()).unwrap();
        let signature = alt_signature_of(hybrid.certificate.der());

        // Same keys and params reproduce a valid certificate
        let rebuilt = with_alt_signature(base.clone(), &hybrid, &signature);
        assert!(verify_hybrid(&rebuilt).unwrap());

        let mut tampered = signature.clone();
        tampered[100] ^= 0x01;
        let forged = with_alt_signature(base, &hybrid, &tampered);
        // RSA signature over the forged TBS is still valid
        let x509 = X509::from_der(&forged).unwrap();
        assert!(x509.verify(&x509.public_key().unwrap()).unwrap());
        assert!(!verify_hybrid(&forged).unwrap());
    }

    #[test]
    fn test_alt_signature_over_full_tbs_fails() {
        let base = params();
        let hybrid = sign_hybrid(base.clone()).unwrap();

        let mut pre_params = base.clone();
        pre_params.custom_extensions.push(CustomExtension::from_oid_content(
            SUBJECT_ALT_PUBLIC_KEY_INFO,
            hybrid.post_quantum_key.public_key_info(),
        ));
        pre_params.custom_extensions.push(CustomExtension::from_oid_content(
            ALT_SIGNATURE_ALGORITHM,
            alt_signature_algorithm().unwrap(),
        ));
        let full_tbs = pre_certificate_tbs(&pre_params, &hybrid.classical_key).unwrap();
        let wrong = hybrid.post_quantum_key.sign(&full_tbs).unwrap();

        let cert = with_alt_signature(base, &hybrid, &wrong);
        assert!(!verify_hybrid(&cert).unwrap());
    }

    #[test]
    fn test_corrupted_rsa_signature_fails() {
        let hybrid = sign_hybrid(params()).unwrap();
        let mut der = hybrid.certificate.der().to_vec();
        let last = der.len() - 1;
        der[last] ^= 0x01;
        assert!(!verify_hybrid(&der).unwrap());
    }

    #[test]
    fn test_plain_certificate_is_not_hybrid() {
        let key = KeyMaterial::generate(KeyKind::Rsa2048).unwrap();
        let cert = params().self_signed(key.key_pair()).unwrap();
        assert!(!verify_hybrid(cert.der()).unwrap());
    }
}
