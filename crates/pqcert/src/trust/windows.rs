//! Windows machine root store
//!
//! `certutil` is the primary tool. When it is missing or fails for a reason
//! other than privileges, the PowerShell PKI cmdlets are tried instead. The
//! certificate path and subject reach PowerShell through environment
//! variables, never through the script text.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use pqcert_common::Platform;

use super::command::{CommandOutput, CommandRunner};
use super::{command_error, spawn_error, TrustInstallResult, TrustStore};
use crate::ca::RootCertificate;
use crate::error::Result;

/// Environment variable carrying the certificate path to PowerShell
pub const CA_PATH_ENV: &str = "PQCERT_CA_PATH";
/// Environment variable carrying the subject CN to PowerShell
pub const CA_SUBJECT_ENV: &str = "PQCERT_CA_SUBJECT";

const MECHANISM: &str = "windows-certstore";

const PS_IMPORT: &str = "Import-Certificate -FilePath $env:PQCERT_CA_PATH \
    -CertStoreLocation Cert:\\LocalMachine\\Root | Out-Null";
const PS_FIND: &str = "if (Get-ChildItem Cert:\\LocalMachine\\Root | \
    Where-Object { $_.Subject -like \"*CN=$env:PQCERT_CA_SUBJECT*\" }) { exit 0 } else { exit 1 }";
const PS_REMOVE: &str = "Get-ChildItem Cert:\\LocalMachine\\Root | \
    Where-Object { $_.Subject -like \"*CN=$env:PQCERT_CA_SUBJECT*\" } | Remove-Item";

/// Machine-wide `ROOT` store; the process must run as administrator
#[derive(Debug)]
pub struct WindowsCertStore {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsCertStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn certutil(&self, args: &[&str]) -> io::Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run("certutil", &args, &[])
    }

    fn powershell(&self, script: &str, env: &[(&str, &str)]) -> io::Result<CommandOutput> {
        let args: Vec<String> = ["-NoProfile", "-NonInteractive", "-Command", script]
            .iter()
            .map(|a| a.to_string())
            .collect();
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.runner.run("powershell", &args, &env)
    }

    /// Try certutil; `Ok(None)` means fall back to PowerShell
    fn try_certutil(&self, command: &str, args: &[&str]) -> Result<Option<()>> {
        match self.certutil(args) {
            Ok(output) if output.success => Ok(Some(())),
            Ok(output) if output.is_permission_denied() => {
                Err(command_error(MECHANISM, command, &output))
            }
            Ok(output) => {
                warn!(command = %command, error = %output.message(), "certutil failed, trying PowerShell");
                Ok(None)
            }
            Err(e) => {
                debug!(error = %e, "certutil unavailable, trying PowerShell");
                Ok(None)
            }
        }
    }

    fn run_powershell(&self, command: &str, script: &str, env: &[(&str, &str)]) -> Result<()> {
        let output = self
            .powershell(script, env)
            .map_err(|e| spawn_error(MECHANISM, command, &e))?;
        if output.success {
            Ok(())
        } else {
            Err(command_error(MECHANISM, command, &output))
        }
    }
}

impl TrustStore for WindowsCertStore {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn mechanism(&self) -> &'static str {
        MECHANISM
    }

    fn install(&self, root: &RootCertificate) -> Result<TrustInstallResult> {
        let crt_path = root.crt_path.to_string_lossy();
        info!(cert = %crt_path, "Adding root CA to the machine ROOT store");

        if self
            .try_certutil("certutil -addstore", &["-addstore", "-f", "ROOT", &*crt_path])?
            .is_some()
        {
            return Ok(TrustInstallResult::new(
                Platform::Windows,
                true,
                "added to LocalMachine\\Root via certutil",
            ));
        }

        self.run_powershell(
            "powershell Import-Certificate",
            PS_IMPORT,
            &[(CA_PATH_ENV, &*crt_path)],
        )?;
        Ok(TrustInstallResult::new(
            Platform::Windows,
            true,
            "added to LocalMachine\\Root via PowerShell",
        ))
    }

    fn uninstall(&self, common_name: &str) -> Result<TrustInstallResult> {
        if !self.is_installed(common_name)? {
            debug!(common_name = %common_name, "Root CA not in ROOT store");
            return Ok(TrustInstallResult::new(
                Platform::Windows,
                false,
                "not installed",
            ));
        }

        if self
            .try_certutil("certutil -delstore", &["-delstore", "ROOT", common_name])?
            .is_none()
        {
            self.run_powershell(
                "powershell Remove-Item",
                PS_REMOVE,
                &[(CA_SUBJECT_ENV, common_name)],
            )?;
        }
        info!(common_name = %common_name, "Removed root CA from ROOT store");

        Ok(TrustInstallResult::new(
            Platform::Windows,
            false,
            "removed from LocalMachine\\Root",
        ))
    }

    fn is_installed(&self, common_name: &str) -> Result<bool> {
        match self.certutil(&["-store", "ROOT", common_name]) {
            Ok(output) => Ok(output.success),
            Err(_) => {
                let output = self
                    .powershell(PS_FIND, &[(CA_SUBJECT_ENV, common_name)])
                    .map_err(|e| spawn_error(MECHANISM, "powershell Get-ChildItem", &e))?;
                Ok(output.success)
            }
        }
    }
}
