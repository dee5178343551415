//! Content digests of snapshot trees.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use noby_common::{NobyError, NobyResult};
use sha2::{Digest, Sha256};

/// Compute a deterministic SHA-256 digest of the tree rooted at `root`.
///
/// Covers relative paths, entry types, permission bits, file contents and
/// symlink targets. Timestamps and ownership are ignored.
pub fn tree_digest(root: &Path) -> NobyResult<String> {
    let mut hasher = Sha256::new();

    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| NobyError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| NobyError::Internal {
                message: format!("walked outside of {}: {e}", root.display()),
            })?;
        let metadata = entry.metadata().map_err(|e| NobyError::Io(e.into()))?;
        let file_type = entry.file_type();

        hasher.update(relative.as_os_str().as_encoded_bytes());
        hasher.update([0]);
        hasher.update(metadata.permissions().mode().to_le_bytes());

        if file_type.is_dir() {
            hasher.update(b"d");
        } else if file_type.is_symlink() {
            hasher.update(b"l");
            hasher.update(fs::read_link(entry.path())?.as_os_str().as_encoded_bytes());
        } else if file_type.is_file() {
            hasher.update(b"f");
            hasher.update(metadata.len().to_le_bytes());
            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
        } else {
            hasher.update(b"o");
        }
        hasher.update([0]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
