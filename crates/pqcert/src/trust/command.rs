//! Subprocess execution for trust-store tools
//!
//! Commands are argument vectors handed straight to the OS; nothing is ever
//! passed through a shell, so certificate paths and names cannot be
//! interpreted as shell syntax.

use std::fmt::Debug;
use std::io;
use std::process::{Command, Stdio};

use pqcert_config::Elevation;
use tracing::{debug, trace};

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Trimmed stderr, falling back to stdout (certutil reports on stdout)
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Whether the tool refused for lack of privileges
    pub fn is_permission_denied(&self) -> bool {
        mentions_permission_denied(&self.stderr) || mentions_permission_denied(&self.stdout)
    }
}

/// Heuristic over the messages `sudo`, `security`, `certutil` and
/// PowerShell print when privileges are missing
pub fn mentions_permission_denied(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "permission denied",
        "operation not permitted",
        "not authorized",
        "authorization",
        "access is denied",
        "access denied",
        "requires elevation",
        "run as administrator",
        "a password is required",
        "a terminal is required",
        "must be run as root",
    ];
    let lower = text.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Executes external programs
pub trait CommandRunner: Send + Sync + Debug {
    /// Run `program` with `args` and extra environment variables
    ///
    /// `Err` means the program could not be started at all (typically
    /// `NotFound`); a non-zero exit is reported through
    /// [`CommandOutput::success`].
    fn run(&self, program: &str, args: &[String], env: &[(String, String)])
        -> io::Result<CommandOutput>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> io::Result<CommandOutput> {
        debug!(program = %program, args = ?args, "Running trust store command");

        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            // sudo may prompt
            .stdin(Stdio::inherit())
            .output()?;

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            program = %program,
            success = result.success,
            status = ?output.status.code(),
            "Trust store command finished"
        );
        Ok(result)
    }
}

/// Program and arguments, prefixed with `sudo` when elevation is enabled
pub fn elevated(elevation: Elevation, program: &str, args: &[&str]) -> (String, Vec<String>) {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    match elevation {
        Elevation::Sudo => {
            let mut sudo_args = Vec::with_capacity(args.len() + 1);
            sudo_args.push(program.to_string());
            sudo_args.extend(args);
            ("sudo".to_string(), sudo_args)
        }
        Elevation::None => (program.to_string(), args),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Responder = dyn Fn(&str, &[String]) -> io::Result<CommandOutput> + Send + Sync;

    /// One recorded invocation: program followed by its arguments
    pub(crate) type Call = Vec<String>;

    /// Scripted runner that records every invocation
    pub(crate) struct FakeRunner {
        responder: Box<Responder>,
        calls: Mutex<Vec<Call>>,
        envs: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl FakeRunner {
        pub(crate) fn new(
            responder: impl Fn(&str, &[String]) -> io::Result<CommandOutput> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
                envs: Mutex::new(Vec::new()),
            }
        }

        /// Every command succeeds with empty output
        pub(crate) fn succeeding() -> Self {
            Self::new(|_, _| Ok(CommandOutput::ok("")))
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub(crate) fn envs(&self) -> Vec<Vec<(String, String)>> {
            self.envs.lock().clone()
        }
    }

    impl Debug for FakeRunner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeRunner")
                .field("calls", &self.calls.lock().len())
                .finish()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            env: &[(String, String)],
        ) -> io::Result<CommandOutput> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().push(call);
            self.envs.lock().push(env.to_vec());
            (self.responder)(program, args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_prefixes_sudo() {
        let (program, args) = elevated(Elevation::Sudo, "cp", &["a", "b"]);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["cp", "a", "b"]);

        let (program, args) = elevated(Elevation::None, "cp", &["a", "b"]);
        assert_eq!(program, "cp");
        assert_eq!(args, vec!["a", "b"]);
    }

    #[test]
    fn test_permission_markers() {
        assert!(mentions_permission_denied("cp: cannot create regular file: Permission denied"));
        assert!(mentions_permission_denied("sudo: a password is required"));
        assert!(mentions_permission_denied("CertUtil: Access is denied."));
        assert!(mentions_permission_denied(
            "SecTrustSettingsSetTrustSettings: The authorization was denied since no user interaction was possible."
        ));
        assert!(!mentions_permission_denied("certificate already exists"));
    }

    #[test]
    fn test_message_prefers_stderr() {
        let output = CommandOutput {
            success: false,
            stdout: "out".into(),
            stderr: "  err \n".into(),
        };
        assert_eq!(output.message(), "err");
        assert_eq!(CommandOutput::ok(" only stdout ").message(), "only stdout");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_reports_exit_status() {
        let runner = SystemRunner;
        assert!(runner.run("true", &[], &[]).unwrap().success);
        assert!(!runner.run("false", &[], &[]).unwrap().success);
        let err = runner
            .run("pqcert-definitely-missing-binary", &[], &[])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
