//! Enumerations shared by the configuration and the core library.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Signature algorithm family requested for a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Classical 2048-bit RSA
    Rsa,
    /// Post-quantum ML-DSA-65
    MlDsa,
    /// RSA certificate carrying an alternative ML-DSA key and signature
    #[default]
    Hybrid,
}

impl Algorithm {
    /// Wire spelling used by the API and the CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Rsa => "rsa",
            Algorithm::MlDsa => "ml-dsa",
            Algorithm::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown algorithm name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown algorithm '{0}'. Valid algorithms: rsa, ml-dsa, hybrid")]
pub struct ParseAlgorithmError(pub String);

impl FromStr for Algorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(Algorithm::Rsa),
            "ml-dsa" | "mldsa" => Ok(Algorithm::MlDsa),
            "hybrid" => Ok(Algorithm::Hybrid),
            other => Err(ParseAlgorithmError(other.to_string())),
        }
    }
}

/// Operating system family with a native trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    /// Platform the binary was compiled for, if it has a supported trust store
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Platform::MacOs)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
