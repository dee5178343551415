//! Engine configuration.
//!
//! Settings come from `<root>/config.toml` when it exists; command-line flags
//! override individual values afterwards.
//!
//! ```toml
//! backend = "btrfs"
//! shell = "/bin/sh"
//! nspawn = "/usr/bin/systemd-nspawn"
//! exec_timeout = 3600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use noby_common::{NobyError, NobyPaths, NobyResult};
use noby_store::BackendKind;
use serde::{Deserialize, Serialize};

use crate::exec::ProcessExecutor;

/// Engine configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Store locations.
    #[serde(skip)]
    pub paths: NobyPaths,
    /// Snapshot backend.
    pub backend: BackendKind,
    /// Shell for `HOST` commands and inside the sandbox.
    pub shell: PathBuf,
    /// `systemd-nspawn` binary.
    pub nspawn: PathBuf,
    /// Per-command timeout in seconds. Commands run unbounded when unset.
    pub exec_timeout: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: NobyPaths::new(),
            backend: BackendKind::Auto,
            shell: PathBuf::from("/bin/sh"),
            nspawn: PathBuf::from("systemd-nspawn"),
            exec_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Load the configuration of the store at `paths`.
    ///
    /// A missing `config.toml` yields the defaults.
    pub fn load(paths: NobyPaths) -> NobyResult<Self> {
        let file = paths.config_file();
        let mut config = match std::fs::read_to_string(&file) {
            Ok(content) => Self::from_toml(&content, &file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.paths = paths;
        Ok(config)
    }

    fn from_toml(content: &str, file: &Path) -> NobyResult<Self> {
        toml::from_str(content).map_err(|e| NobyError::Config {
            message: format!("Failed to parse {}: {e}", file.display()),
        })
    }

    /// Set the store root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = NobyPaths::with_root(root);
        self
    }

    /// Set the snapshot backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the per-command timeout in seconds.
    #[must_use]
    pub const fn with_exec_timeout(mut self, seconds: Option<u64>) -> Self {
        self.exec_timeout = seconds;
        self
    }

    /// Executor for build and run commands.
    #[must_use]
    pub fn executor(&self) -> ProcessExecutor {
        ProcessExecutor::new()
            .with_shell(&self.shell)
            .with_nspawn(&self.nspawn)
            .with_timeout(self.exec_timeout.map(Duration::from_secs))
    }
}
