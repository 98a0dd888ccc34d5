//! Key generation and encoding
//!
//! Thin typed layer over `rcgen`'s aws-lc-rs backend. Key bytes never leave
//! this module except as PEM/DER artifacts destined for owner-only files.

use std::fmt;

use rcgen::{KeyPair, PublicKeyData, RsaKeySize, SignatureAlgorithm, SigningKey};

use crate::error::{PqcertError, Result};

/// Concrete key type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa2048,
    Rsa4096,
    MlDsa65,
}

impl KeyKind {
    pub fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyKind::Rsa2048 | KeyKind::Rsa4096 => &rcgen::PKCS_RSA_SHA256,
            KeyKind::MlDsa65 => &rcgen::PKCS_ML_DSA_65,
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self, KeyKind::Rsa2048 | KeyKind::Rsa4096)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Rsa2048 => "rsa-2048",
            KeyKind::Rsa4096 => "rsa-4096",
            KeyKind::MlDsa65 => "ml-dsa-65",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private key tagged with its kind
pub struct KeyMaterial {
    kind: KeyKind,
    key_pair: KeyPair,
}

impl KeyMaterial {
    /// Generate a fresh key
    pub fn generate(kind: KeyKind) -> Result<Self> {
        let alg = kind.signature_algorithm();
        let key_pair = match kind {
            KeyKind::Rsa2048 => KeyPair::generate_rsa_for(alg, RsaKeySize::_2048),
            KeyKind::Rsa4096 => KeyPair::generate_rsa_for(alg, RsaKeySize::_4096),
            KeyKind::MlDsa65 => KeyPair::generate_for(alg),
        }
        .map_err(|e| PqcertError::crypto("generate key", e))?;

        Ok(Self { kind, key_pair })
    }

    /// Load a PKCS#8 PEM key of a known kind
    pub fn from_pem(kind: KeyKind, pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem_and_sign_algo(pem, kind.signature_algorithm())
            .map_err(|e| PqcertError::crypto("load key", e))?;
        Ok(Self { kind, key_pair })
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub(crate) fn into_key_pair(self) -> KeyPair {
        self.key_pair
    }

    /// PKCS#8 PEM encoding
    pub fn to_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// PKCS#8 DER encoding
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        self.key_pair.serialize_der()
    }

    /// DER SubjectPublicKeyInfo
    pub fn public_key_info(&self) -> Vec<u8> {
        self.key_pair.subject_public_key_info()
    }

    /// Raw signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.key_pair
            .sign(message)
            .map_err(|e| PqcertError::crypto("sign message", e))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kind", &self.kind)
            .field("key", &"<redacted>")
            .finish()
    }
}
