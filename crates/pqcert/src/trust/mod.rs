//! Operating-system trust store integration
//!
//! One [`TrustStore`] implementation per platform, chosen once at startup by
//! [`detect_trust_store`]:
//!
//! | Platform | Implementation        | Mechanism                                   |
//! |----------|-----------------------|---------------------------------------------|
//! | macOS    | [`MacKeychainStore`]  | `security` against the System keychain      |
//! | Linux    | [`LinuxAnchorStore`]  | distro anchor directory + refresh command   |
//! | Windows  | [`WindowsCertStore`]  | `certutil`, PowerShell `Import-Certificate` |
//!
//! Every operation needs administrator rights. Missing privileges surface as
//! [`PqcertError::PermissionDenied`] naming the mechanism that refused.
//! These calls block, possibly on an interactive password prompt, and must
//! never run while a lock is held.

mod command;
mod linux;
mod macos;
mod windows;

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use pqcert_common::Platform;
use pqcert_config::TrustConfig;

use crate::ca::RootCertificate;
use crate::error::{PqcertError, Result};

pub use command::{elevated, mentions_permission_denied, CommandOutput, CommandRunner, SystemRunner};
pub use linux::{AnchorFamily, LinuxAnchorStore, ANCHOR_FILE_NAME};
pub use macos::{MacKeychainStore, SYSTEM_KEYCHAIN};
pub use windows::{WindowsCertStore, CA_PATH_ENV, CA_SUBJECT_ENV};

/// Outcome of an install or uninstall
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustInstallResult {
    pub platform: Platform,
    /// Whether the root is in the store after the operation
    pub installed: bool,
    pub detail: String,
}

impl TrustInstallResult {
    pub fn new(platform: Platform, installed: bool, detail: impl Into<String>) -> Self {
        Self {
            platform,
            installed,
            detail: detail.into(),
        }
    }
}

/// A platform trust store that can hold the local root CA
pub trait TrustStore: Send + Sync + std::fmt::Debug {
    fn platform(&self) -> Platform;

    /// Short name of the tool or location used, for error reports
    fn mechanism(&self) -> &'static str;

    /// Add `root` as a trusted root
    fn install(&self, root: &RootCertificate) -> Result<TrustInstallResult>;

    /// Remove the root named `common_name`; succeeds when it is absent
    fn uninstall(&self, common_name: &str) -> Result<TrustInstallResult>;

    /// Whether a root named `common_name` is currently in the store
    fn is_installed(&self, common_name: &str) -> Result<bool>;
}

/// Trust store for the running OS
pub fn detect_trust_store(config: &TrustConfig) -> Result<Box<dyn TrustStore>> {
    let platform = Platform::current()
        .ok_or_else(|| PqcertError::TrustStoreUnsupportedPlatform(std::env::consts::OS.to_string()))?;
    let store = trust_store_for(platform, config, Arc::new(SystemRunner));
    info!(platform = %platform, mechanism = store.mechanism(), "Selected trust store");
    Ok(store)
}

/// Trust store for `platform` driving commands through `runner`
pub fn trust_store_for(
    platform: Platform,
    config: &TrustConfig,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn TrustStore> {
    match platform {
        Platform::MacOs => Box::new(MacKeychainStore::new(runner, config.elevation)),
        Platform::Linux => Box::new(LinuxAnchorStore::new(runner, config.elevation)),
        Platform::Windows => Box::new(WindowsCertStore::new(runner)),
    }
}

/// Error for a command that ran and failed
pub(crate) fn command_error(mechanism: &str, command: &str, output: &CommandOutput) -> PqcertError {
    let detail = format!("{}: {}", command, output.message());
    if output.is_permission_denied() {
        PqcertError::PermissionDenied {
            mechanism: mechanism.to_string(),
            detail,
        }
    } else {
        PqcertError::TrustStoreFailed {
            mechanism: mechanism.to_string(),
            detail,
        }
    }
}

/// Error for a command that could not be started
pub(crate) fn spawn_error(mechanism: &str, command: &str, err: &std::io::Error) -> PqcertError {
    let detail = format!("{}: {}", command, err);
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        PqcertError::PermissionDenied {
            mechanism: mechanism.to_string(),
            detail,
        }
    } else {
        PqcertError::TrustStoreFailed {
            mechanism: mechanism.to_string(),
            detail,
        }
    }
}
