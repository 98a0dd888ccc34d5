//! Linux distribution trust anchors
//!
//! The root is copied into the anchor directory of the first packaging
//! family present on the host, then the family's refresh tool rebuilds the
//! consolidated bundle. Direct file operations are tried first; with `sudo`
//! elevation a refused write is retried through `sudo cp` / `sudo rm -f`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use pqcert_common::Platform;
use pqcert_config::Elevation;

use super::command::{elevated, CommandRunner};
use super::{command_error, spawn_error, TrustInstallResult, TrustStore};
use crate::ca::RootCertificate;
use crate::error::{PqcertError, Result};

/// File name of the root inside anchor directories
pub const ANCHOR_FILE_NAME: &str = "pqcert-ca.crt";

const MECHANISM: &str = "linux-trust-anchors";

/// Anchor directory and refresh command of one packaging family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorFamily {
    pub name: &'static str,
    pub dir: PathBuf,
    pub refresh: Vec<String>,
}

impl AnchorFamily {
    fn new(name: &'static str, dir: &str, refresh: &[&str]) -> Self {
        Self {
            name,
            dir: PathBuf::from(dir),
            refresh: refresh.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Debian/Ubuntu, RHEL/Fedora and Arch, in lookup order
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "debian",
                "/usr/local/share/ca-certificates",
                &["update-ca-certificates"],
            ),
            Self::new(
                "rhel",
                "/etc/pki/ca-trust/source/anchors",
                &["update-ca-trust", "extract"],
            ),
            Self::new(
                "arch",
                "/etc/ca-certificates/trust-source/anchors",
                &["trust", "extract-compat"],
            ),
        ]
    }

    fn anchor_path(&self) -> PathBuf {
        self.dir.join(ANCHOR_FILE_NAME)
    }
}

/// Trust anchors of the major Linux packaging families
#[derive(Debug)]
pub struct LinuxAnchorStore {
    runner: Arc<dyn CommandRunner>,
    elevation: Elevation,
    families: Vec<AnchorFamily>,
}

impl LinuxAnchorStore {
    pub fn new(runner: Arc<dyn CommandRunner>, elevation: Elevation) -> Self {
        Self::with_families(runner, elevation, AnchorFamily::defaults())
    }

    /// Store probing `families` instead of the system defaults
    pub fn with_families(
        runner: Arc<dyn CommandRunner>,
        elevation: Elevation,
        families: Vec<AnchorFamily>,
    ) -> Self {
        Self {
            runner,
            elevation,
            families,
        }
    }

    fn run_elevated(&self, program: &str, args: &[&str]) -> Result<()> {
        let (program, args) = elevated(self.elevation, program, args);
        let command = format!("{} {}", program, args.join(" "));
        let output = self
            .runner
            .run(&program, &args, &[])
            .map_err(|e| spawn_error(MECHANISM, &command, &e))?;
        if output.success {
            Ok(())
        } else {
            Err(command_error(MECHANISM, &command, &output))
        }
    }

    fn copy_anchor(&self, source: &Path, dest: &Path) -> Result<()> {
        match fs::copy(source, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                if self.elevation == Elevation::None {
                    return Err(PqcertError::PermissionDenied {
                        mechanism: MECHANISM.to_string(),
                        detail: format!("copy to {}: {}", dest.display(), e),
                    });
                }
                debug!(dest = %dest.display(), "Direct copy refused, retrying with sudo");
                let (source, dest) = (source.to_string_lossy(), dest.to_string_lossy());
                self.run_elevated("cp", &[&*source, &*dest])
            }
            Err(e) => Err(PqcertError::TrustStoreFailed {
                mechanism: MECHANISM.to_string(),
                detail: format!("copy to {}: {}", dest.display(), e),
            }),
        }
    }

    fn remove_anchor(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                if self.elevation == Elevation::None {
                    return Err(PqcertError::PermissionDenied {
                        mechanism: MECHANISM.to_string(),
                        detail: format!("remove {}: {}", path.display(), e),
                    });
                }
                let path = path.to_string_lossy();
                self.run_elevated("rm", &["-f", &*path])
            }
            Err(e) => Err(PqcertError::TrustStoreFailed {
                mechanism: MECHANISM.to_string(),
                detail: format!("remove {}: {}", path.display(), e),
            }),
        }
    }

    /// Run refresh commands, the installed family's first, until one works
    fn refresh(&self, preferred: &AnchorFamily) -> bool {
        let others = self.families.iter().filter(|f| f.name != preferred.name);
        for family in std::iter::once(preferred).chain(others) {
            let Some((program, rest)) = family.refresh.split_first() else {
                continue;
            };
            let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
            match self.run_elevated(program, &rest) {
                Ok(()) => {
                    debug!(family = family.name, command = %program, "Trust store refreshed");
                    return true;
                }
                Err(e) => debug!(family = family.name, error = %e, "Refresh command failed"),
            }
        }
        false
    }
}

impl TrustStore for LinuxAnchorStore {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn mechanism(&self) -> &'static str {
        MECHANISM
    }

    fn install(&self, root: &RootCertificate) -> Result<TrustInstallResult> {
        let family = self
            .families
            .iter()
            .find(|f| f.dir.is_dir())
            .ok_or_else(|| PqcertError::TrustStoreFailed {
                mechanism: MECHANISM.to_string(),
                detail: "no known trust anchor directory exists".to_string(),
            })?;

        let dest = family.anchor_path();
        info!(family = family.name, dest = %dest.display(), "Installing root CA anchor");
        self.copy_anchor(&root.crt_path, &dest)?;

        if self.refresh(family) {
            Ok(TrustInstallResult::new(
                Platform::Linux,
                true,
                format!("installed to {}", dest.display()),
            ))
        } else {
            warn!(dest = %dest.display(), "Anchor copied but no refresh command succeeded");
            Ok(TrustInstallResult::new(
                Platform::Linux,
                true,
                "trust store not refreshed",
            ))
        }
    }

    fn uninstall(&self, _common_name: &str) -> Result<TrustInstallResult> {
        let present: Vec<&AnchorFamily> = self
            .families
            .iter()
            .filter(|f| f.anchor_path().exists())
            .collect();

        let Some(first) = present.first().copied() else {
            debug!("Root CA anchor not present, nothing to uninstall");
            return Ok(TrustInstallResult::new(
                Platform::Linux,
                false,
                "not installed",
            ));
        };

        for family in &present {
            self.remove_anchor(&family.anchor_path())?;
            info!(family = family.name, "Removed root CA anchor");
        }

        let detail = if self.refresh(first) {
            "removed from trust anchors"
        } else {
            "removed; trust store not refreshed"
        };
        Ok(TrustInstallResult::new(Platform::Linux, false, detail))
    }

    fn is_installed(&self, _common_name: &str) -> Result<bool> {
        Ok(self.families.iter().any(|f| f.anchor_path().exists()))
    }
}
