//! Standard filesystem paths for noby.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::key::LayerKey;

/// Default root directory for noby data.
pub static NOBY_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("NOBY_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/noby"))
});

/// Standard paths used by the layer store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NobyPaths {
    /// Root data directory (default: /var/lib/noby).
    pub root: PathBuf,
}

impl NobyPaths {
    /// Create paths with the default location.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding sealed layers.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Sealed layer snapshot by key.
    #[must_use]
    pub fn layer(&self, key: &LayerKey) -> PathBuf {
        self.layers().join(key.as_str())
    }

    /// Directory holding writable snapshots of in-progress builds.
    #[must_use]
    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Directory holding run instances.
    #[must_use]
    pub fn runs(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// Persisted layer index.
    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Persisted tag registry.
    #[must_use]
    pub fn tags_file(&self) -> PathBuf {
        self.root.join("tags.json")
    }

    /// Store lock file.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Optional engine configuration file.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.layers())?;
        std::fs::create_dir_all(self.work())?;
        std::fs::create_dir_all(self.runs())?;
        Ok(())
    }
}

impl Default for NobyPaths {
    fn default() -> Self {
        Self {
            root: NOBY_ROOT.clone(),
        }
    }
}
