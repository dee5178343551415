//! Copy-on-write snapshot backends.
//!
//! A backend only knows how to create, clone and remove directory trees.
//! Keys, parents and the index are the [`LayerStore`](crate::LayerStore)'s
//! business.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use noby_common::{NobyError, NobyResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Filesystem magic reported by `statfs` for btrfs.
const BTRFS_SUPER_MAGIC: u64 = 0x9123_683E;

/// Snapshot operations the layer store relies on.
#[async_trait]
pub trait SnapshotBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create an empty writable snapshot at `path`.
    async fn create_empty(&self, path: &Path) -> NobyResult<()>;

    /// Clone `source` into a new snapshot at `dest`.
    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> NobyResult<()>;

    /// Remove the snapshot at `path`.
    async fn delete(&self, path: &Path) -> NobyResult<()>;
}

/// Which backend to use for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Btrfs when the store root is on btrfs, plain directories otherwise.
    #[default]
    Auto,
    /// Btrfs subvolumes.
    Btrfs,
    /// Plain directory copies.
    Directory,
}

impl BackendKind {
    /// Instantiate the backend for a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `Auto` cannot inspect the filesystem of `root`.
    pub fn open(self, root: &Path) -> NobyResult<Arc<dyn SnapshotBackend>> {
        let kind = match self {
            Self::Auto => {
                if is_btrfs(root)? {
                    Self::Btrfs
                } else {
                    tracing::warn!(
                        root = %root.display(),
                        "Store root is not on btrfs, falling back to directory copies"
                    );
                    Self::Directory
                }
            }
            other => other,
        };

        Ok(match kind {
            Self::Btrfs => Arc::new(BtrfsBackend::new()),
            _ => Arc::new(DirectoryBackend),
        })
    }
}

impl FromStr for BackendKind {
    type Err = NobyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "btrfs" => Ok(Self::Btrfs),
            "directory" | "dir" => Ok(Self::Directory),
            other => Err(NobyError::Config {
                message: format!("Unknown backend '{other}', expected auto, btrfs or directory"),
            }),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Btrfs => write!(f, "btrfs"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// Check whether `path` lives on a btrfs filesystem.
#[allow(clippy::cast_sign_loss, clippy::unnecessary_cast)]
fn is_btrfs(path: &Path) -> NobyResult<bool> {
    let stat = rustix::fs::statfs(path).map_err(|e| NobyError::storage("statfs", e))?;
    // f_type is signed on some targets; only the low 32 bits carry the magic.
    Ok((stat.f_type as u64) & 0xFFFF_FFFF == BTRFS_SUPER_MAGIC)
}

/// Btrfs subvolume backend driven through the `btrfs` command.
#[derive(Debug, Clone)]
pub struct BtrfsBackend {
    /// Path or name of the `btrfs` binary.
    program: PathBuf,
}

impl BtrfsBackend {
    /// Create a backend using `btrfs` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("btrfs"),
        }
    }

    async fn subvolume(&self, operation: &str, args: &[&std::ffi::OsStr]) -> NobyResult<()> {
        tracing::debug!(operation, ?args, "Running btrfs subvolume");

        let output = Command::new(&self.program)
            .arg("subvolume")
            .args(args)
            .output()
            .await
            .map_err(|e| {
                NobyError::storage(operation, format!("failed to execute btrfs: {e}"))
            })?;

        if !output.status.success() {
            return Err(NobyError::storage(
                operation,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        Ok(())
    }
}

impl Default for BtrfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotBackend for BtrfsBackend {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    async fn create_empty(&self, path: &Path) -> NobyResult<()> {
        self.subvolume("create", &["create".as_ref(), path.as_os_str()])
            .await
    }

    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> NobyResult<()> {
        let mut args: Vec<&std::ffi::OsStr> = vec!["snapshot".as_ref()];
        if read_only {
            args.push("-r".as_ref());
        }
        args.push(source.as_os_str());
        args.push(dest.as_os_str());
        self.subvolume("snapshot", &args).await
    }

    async fn delete(&self, path: &Path) -> NobyResult<()> {
        self.subvolume("delete", &["delete".as_ref(), path.as_os_str()])
            .await
    }
}

/// Backend that clones by copying whole trees.
///
/// Read-only is not enforced on sealed copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryBackend;

#[async_trait]
impl SnapshotBackend for DirectoryBackend {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn create_empty(&self, path: &Path) -> NobyResult<()> {
        if path.exists() {
            return Err(NobyError::storage(
                "create",
                format!("{} already exists", path.display()),
            ));
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| NobyError::storage("create", e))
    }

    async fn snapshot(&self, source: &Path, dest: &Path, _read_only: bool) -> NobyResult<()> {
        if !source.is_dir() {
            return Err(NobyError::storage(
                "snapshot",
                format!("{} does not exist", source.display()),
            ));
        }
        if dest.exists() {
            return Err(NobyError::storage(
                "snapshot",
                format!("{} already exists", dest.display()),
            ));
        }

        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| NobyError::Internal {
                message: format!("copy task failed: {e}"),
            })?
            .map_err(|e| NobyError::storage("snapshot", e))
    }

    async fn delete(&self, path: &Path) -> NobyResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NobyError::storage("delete", e)),
        }
    }
}

/// Copy a directory tree, preserving permissions and symlinks.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut dir_permissions = vec![(dest.to_path_buf(), fs::metadata(source)?.permissions())];

    for entry in walkdir::WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            dir_permissions.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    // Children first, so read-only directories do not block their contents.
    for (dir, permissions) in dir_permissions.into_iter().rev() {
        fs::set_permissions(dir, permissions)?;
    }

    Ok(())
}
