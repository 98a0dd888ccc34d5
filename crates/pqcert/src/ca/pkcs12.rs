//! PKCS#12 bundles for platforms that import key, leaf and CA together

use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;

use crate::error::{PqcertError, Result};

/// Password-protected PKCS#12 holding the key, the leaf and the issuing CA
pub fn build_pfx(
    friendly_name: &str,
    key_pkcs8_der: &[u8],
    leaf_der: &[u8],
    ca_der: &[u8],
    password: &str,
) -> Result<Vec<u8>> {
    let encode = |e: openssl::error::ErrorStack| PqcertError::crypto("encode pkcs12", e);

    let pkey = PKey::private_key_from_pkcs8(key_pkcs8_der).map_err(encode)?;
    let leaf = X509::from_der(leaf_der).map_err(encode)?;
    let ca = X509::from_der(ca_der).map_err(encode)?;

    let mut chain = Stack::new().map_err(encode)?;
    chain.push(ca).map_err(encode)?;

    let pfx = Pkcs12::builder()
        .name(friendly_name)
        .pkey(&pkey)
        .cert(&leaf)
        .ca(chain)
        .build2(password)
        .map_err(encode)?;

    pfx.to_der().map_err(encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::crypto::{KeyKind, KeyMaterial};
    use rcgen::{BasicConstraints, CertificateParams, IsCa, Issuer};

    #[test]
    fn test_pfx_round_trip() {
        let ca_key = KeyMaterial::generate(KeyKind::Rsa2048).unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let ca_cert = ca_params.clone().self_signed(ca_key.key_pair()).unwrap();
        let issuer = Issuer::new(ca_params, ca_key.into_key_pair());

        let leaf_key = KeyMaterial::generate(KeyKind::Rsa2048).unwrap();
        let leaf = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(leaf_key.key_pair(), &issuer)
            .unwrap();

        let der = build_pfx(
            "localhost",
            &leaf_key.to_pkcs8_der(),
            leaf.der(),
            ca_cert.der(),
            "pqcert",
        )
        .unwrap();

        let parsed = Pkcs12::from_der(&der).unwrap().parse2("pqcert").unwrap();
        assert!(parsed.pkey.is_some());
        assert_eq!(parsed.cert.unwrap().to_der().unwrap(), leaf.der().to_vec());
        assert_eq!(parsed.ca.unwrap().len(), 1);

        assert!(Pkcs12::from_der(&der).unwrap().parse2("wrong").is_err());
    }

    #[test]
    fn test_garbage_key_is_crypto_error() {
        let err = build_pfx("x", b"nope", b"nope", b"nope", "pw").unwrap_err();
        assert!(matches!(
            err,
            PqcertError::CryptoOperationFailed { operation: "encode pkcs12", .. }
        ));
    }
}
