//! PQCert configuration
//!
//! Configuration is written in KDL. Every block is optional; anything left
//! out falls back to the defaults below, which reproduce the behaviour of a
//! zero-config install.
//!
//! ```kdl
//! storage { data-dir "~/.pqcert/data" }
//! challenge { ttl-secs 3600 }
//! validator { timeout-secs 10 }
//! issuance { validity-days 90; default-algorithm "hybrid" }
//! local-ca {
//!     base-dir "~/.pqcert"
//!     leaf-validity-days 825
//!     pfx-password "pqcert"
//!     aliases "local.dev" "*.local.dev"
//! }
//! renewal { threshold-days 30 }
//! trust { elevate "sudo" }
//! client {
//!     server-url "https://api.pqcert.org"
//!     webroot "/var/www/html"
//!     certs-dir "~/.pqcert/domains"
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pqcert_common::Algorithm;

mod parse;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "PQCERT_CONFIG";

/// Environment variable overriding the local CA base directory
pub const DIR_ENV: &str = "PQCERT_DIR";

/// Environment variable overriding the issuance server for `pqcert get`
pub const API_ENV: &str = "PQCERT_API";

/// Longest leaf lifetime browsers accept for locally trusted certificates
pub const MAX_LOCAL_LEAF_DAYS: u32 = 825;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub local_ca: LocalCaConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where challenge and certificate records live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    default_base_dir().join("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Domain-validation challenge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Lifetime of a challenge token
    #[serde(default = "default_challenge_ttl")]
    pub ttl_secs: u64,

    /// Well-known path under which the token must be published
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_challenge_ttl() -> u64 { 3600 }
fn default_path_prefix() -> String { "/.well-known/pqcert-challenge/".to_string() }

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_challenge_ttl(),
            path_prefix: default_path_prefix(),
        }
    }
}

/// HTTP reachability check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_timeout")]
    pub timeout_secs: u64,

    /// Upper bound on how much of the challenge response body is read
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_validator_timeout() -> u64 { 10 }
fn default_max_body_bytes() -> usize { 64 * 1024 }

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_validator_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Domain-validated issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    #[serde(default)]
    pub default_algorithm: Algorithm,
}

fn default_validity_days() -> u32 { 90 }

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
            default_algorithm: Algorithm::default(),
        }
    }
}

/// Local development CA settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCaConfig {
    /// Root of the `ca/` and `certs/` directories
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default = "default_ca_common_name")]
    pub common_name: String,

    #[serde(default = "default_organization")]
    pub organization: String,

    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,

    #[serde(default = "default_country")]
    pub country: String,

    #[serde(default = "default_root_validity_days")]
    pub root_validity_days: u32,

    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,

    /// Password protecting generated PKCS#12 bundles
    #[serde(default = "default_pfx_password")]
    pub pfx_password: String,

    /// Local TLD aliases added to every local leaf, after the loopback names
    #[serde(default = "default_aliases")]
    pub aliases: Vec<String>,
}

fn default_base_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".pqcert"))
        .unwrap_or_else(|| PathBuf::from(".pqcert"))
}
fn default_ca_common_name() -> String { "PQCert Local Development CA".to_string() }
fn default_organization() -> String { "PQCert".to_string() }
fn default_organizational_unit() -> String { "Local Development".to_string() }
fn default_country() -> String { "US".to_string() }
fn default_root_validity_days() -> u32 { 3650 }
fn default_leaf_validity_days() -> u32 { MAX_LOCAL_LEAF_DAYS }
fn default_pfx_password() -> String { "pqcert".to_string() }
fn default_aliases() -> Vec<String> {
    [
        "local.dev",
        "*.local.dev",
        "dev.local",
        "*.dev.local",
        "test.local",
        "*.test.local",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LocalCaConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            common_name: default_ca_common_name(),
            organization: default_organization(),
            organizational_unit: default_organizational_unit(),
            country: default_country(),
            root_validity_days: default_root_validity_days(),
            leaf_validity_days: default_leaf_validity_days(),
            pfx_password: default_pfx_password(),
            aliases: default_aliases(),
        }
    }
}

impl LocalCaConfig {
    /// Directory holding the root key and certificate
    pub fn ca_dir(&self) -> PathBuf {
        self.base_dir.join("ca")
    }

    /// Directory holding per-hostname leaf artifacts
    pub fn certs_dir(&self) -> PathBuf {
        self.base_dir.join("certs")
    }
}

/// Renewal scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "default_threshold_days")]
    pub threshold_days: u32,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

fn default_threshold_days() -> u32 { 30 }
fn default_check_interval() -> u64 { 12 * 3600 }

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_threshold_days(),
            check_interval_secs: default_check_interval(),
        }
    }
}

/// How privileged trust-store commands are run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Run commands directly; the caller must already be privileged
    None,
    /// Prefix commands with `sudo` on Unix
    #[default]
    Sudo,
}

/// Trust store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default)]
    pub elevation: Elevation,
}

/// Settings for fetching certificates from a remote issuance server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the certificate API
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Document root served for the domain; tokens go under its
    /// `.well-known/pqcert-challenge/`
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Downloaded certificates, one directory per domain
    #[serde(default = "default_domains_dir")]
    pub certs_dir: PathBuf,

    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,

    /// Pause between publishing the token and asking for verification
    #[serde(default = "default_publish_delay")]
    pub publish_delay_secs: u64,
}

fn default_server_url() -> String { "https://api.pqcert.org".to_string() }
fn default_webroot() -> PathBuf { PathBuf::from("/var/www/html") }
fn default_domains_dir() -> PathBuf { default_base_dir().join("domains") }
fn default_client_timeout() -> u64 { 60 }
fn default_publish_delay() -> u64 { 2 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            webroot: default_webroot(),
            certs_dir: default_domains_dir(),
            timeout_secs: default_client_timeout(),
            publish_delay_secs: default_publish_delay(),
        }
    }
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        info!(path = %path.display(), "Loading configuration");
        Self::from_kdl(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    /// Parse configuration from KDL text
    pub fn from_kdl(content: &str) -> Result<Self> {
        parse::parse_config(content)
    }

    /// Resolve the effective configuration.
    ///
    /// Priority: explicit path > `PQCERT_CONFIG` > built-in defaults. The
    /// `PQCERT_DIR` variable then overrides the local CA base directory and
    /// `PQCERT_API` the issuance server.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => {
                debug!("No configuration file specified, using defaults");
                Self::default()
            }
        };

        if let Some(dir) = std::env::var_os(DIR_ENV) {
            config.local_ca.base_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var(API_ENV) {
            config.client.server_url = url;
        }
        config.local_ca.base_dir = expand_home(&config.local_ca.base_dir);
        config.storage.data_dir = expand_home(&config.storage.data_dir);
        config.client.webroot = expand_home(&config.client.webroot);
        config.client.certs_dir = expand_home(&config.client.certs_dir);

        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        let result = validate::validate_config(self);
        result.into_result()
    }
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}
