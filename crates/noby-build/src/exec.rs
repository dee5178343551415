//! Command execution.
//!
//! The build engine never spawns processes itself; it hands every `HOST` and
//! `RUN` command to a [`CommandExecutor`]. [`ProcessExecutor`] is the real
//! one: `sh -c` on the host, `systemd-nspawn` inside a snapshot.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::env::EnvSet;

/// Name of the variable pointing `HOST` commands at the snapshot root.
pub const TARGET_VAR: &str = "TARGET";

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the build host, with `$TARGET` set to the snapshot root.
    Host,
    /// Inside the snapshot root.
    Sandbox,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// One command to execute.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Shell command line.
    pub command: String,
    /// Root of the snapshot the command works on.
    pub root: PathBuf,
    /// Host working directory for [`ExecutionMode::Host`].
    pub workdir: PathBuf,
    /// Resolved environment.
    pub env: EnvSet,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs build and run commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Execute `invocation`, returning once the command has finished.
    ///
    /// A non-zero exit status is reported in [`ExecOutput`]; errors mean the
    /// command could not be started or did not finish.
    async fn execute(&self, invocation: &Invocation) -> io::Result<ExecOutput>;
}

/// Executor that spawns real processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    /// Shell used for `HOST` commands and inside the sandbox.
    shell: PathBuf,
    /// `systemd-nspawn` binary.
    nspawn: PathBuf,
    /// Optional per-command timeout.
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    /// Create an executor with default binaries and no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            nspawn: PathBuf::from("systemd-nspawn"),
            timeout: None,
        }
    }

    /// Use a different shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Use a different `systemd-nspawn` binary.
    #[must_use]
    pub fn with_nspawn(mut self, nspawn: impl Into<PathBuf>) -> Self {
        self.nspawn = nspawn.into();
        self
    }

    /// Kill commands that run longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        match invocation.mode {
            ExecutionMode::Host => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c")
                    .arg(&invocation.command)
                    .current_dir(&invocation.workdir)
                    .env_clear();
                if let Some(path) = std::env::var_os("PATH") {
                    cmd.env("PATH", path);
                }
                cmd.envs(&invocation.env).env(TARGET_VAR, &invocation.root);
                cmd
            }
            ExecutionMode::Sandbox => {
                let mut cmd = Command::new(&self.nspawn);
                cmd.arg("--quiet")
                    .arg("--register=no")
                    .arg("--directory")
                    .arg(&invocation.root)
                    .arg("--console=pipe");
                for (name, value) in &invocation.env {
                    cmd.arg(format!("--setenv={name}={value}"));
                }
                cmd.arg(&self.shell)
                    .arg("-c")
                    .arg(&invocation.command)
                    .current_dir(&invocation.root);
                cmd
            }
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &Invocation) -> io::Result<ExecOutput> {
        let mut cmd = self.command(invocation);

        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(mode = %invocation.mode, command = %invocation.command, "Spawning command");
        let child = cmd.spawn()?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("command timed out after {}s", limit.as_secs()),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        let result = ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        for line in result.stdout.lines() {
            tracing::debug!(stream = "stdout", "{line}");
        }
        for line in result.stderr.lines() {
            tracing::debug!(stream = "stderr", "{line}");
        }

        Ok(result)
    }
}
