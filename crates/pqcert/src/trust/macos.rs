//! macOS System keychain via the `security` tool

use std::sync::Arc;

use tracing::{debug, info};

use pqcert_common::Platform;
use pqcert_config::Elevation;

use super::command::{elevated, CommandRunner};
use super::{command_error, spawn_error, TrustInstallResult, TrustStore};
use crate::ca::RootCertificate;
use crate::error::Result;

pub const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

const MECHANISM: &str = "macos-keychain";

/// Roots trusted machine-wide through the System keychain
#[derive(Debug)]
pub struct MacKeychainStore {
    runner: Arc<dyn CommandRunner>,
    elevation: Elevation,
    keychain: String,
}

impl MacKeychainStore {
    pub fn new(runner: Arc<dyn CommandRunner>, elevation: Elevation) -> Self {
        Self {
            runner,
            elevation,
            keychain: SYSTEM_KEYCHAIN.to_string(),
        }
    }

    /// Privileged `security` subcommand
    fn security(&self, args: &[&str]) -> Result<()> {
        let command = format!("security {}", args.first().copied().unwrap_or_default());
        let (program, argv) = elevated(self.elevation, "security", args);
        let output = self
            .runner
            .run(&program, &argv, &[])
            .map_err(|e| spawn_error(MECHANISM, &command, &e))?;
        if output.success {
            Ok(())
        } else {
            Err(command_error(MECHANISM, &command, &output))
        }
    }
}

impl TrustStore for MacKeychainStore {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn mechanism(&self) -> &'static str {
        MECHANISM
    }

    fn install(&self, root: &RootCertificate) -> Result<TrustInstallResult> {
        let pem_path = root.pem_path.to_string_lossy();
        info!(keychain = %self.keychain, cert = %pem_path, "Adding root CA to keychain");

        self.security(
            &[
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                self.keychain.as_str(),
                &*pem_path,
            ],
        )?;

        Ok(TrustInstallResult::new(
            Platform::MacOs,
            true,
            format!("trusted in {}", self.keychain),
        ))
    }

    fn uninstall(&self, common_name: &str) -> Result<TrustInstallResult> {
        if !self.is_installed(common_name)? {
            debug!(common_name = %common_name, "Root CA not in keychain");
            return Ok(TrustInstallResult::new(
                Platform::MacOs,
                false,
                "not installed",
            ));
        }

        self.security(&["delete-certificate", "-c", common_name, self.keychain.as_str()])?;
        info!(common_name = %common_name, "Removed root CA from keychain");

        Ok(TrustInstallResult::new(
            Platform::MacOs,
            false,
            format!("removed from {}", self.keychain),
        ))
    }

    fn is_installed(&self, common_name: &str) -> Result<bool> {
        // find-certificate exits non-zero when nothing matches
        let args = vec![
            "find-certificate".to_string(),
            "-c".to_string(),
            common_name.to_string(),
            self.keychain.clone(),
        ];
        let output = self
            .runner
            .run("security", &args, &[])
            .map_err(|e| spawn_error(MECHANISM, "security find-certificate", &e))?;
        Ok(output.success)
    }
}
