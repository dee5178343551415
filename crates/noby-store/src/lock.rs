//! File-based store locking for mutual exclusion between processes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use noby_common::{NobyError, NobyPaths, NobyResult};
use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};

/// How the store is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers that only need the layers to stay put.
    Shared,
    /// Anything that mutates the index, the tags or the layers.
    Exclusive,
}

/// Written into the lock file by exclusive holders.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Holder process id.
    pub pid: u32,
    /// When the lock was taken.
    pub started_at: DateTime<Utc>,
    /// What the holder is doing.
    pub command: String,
}

/// A held store lock; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    lock_path: PathBuf,
    mode: LockMode,
}

impl StoreLock {
    /// Block until the lock is acquired.
    ///
    /// This blocks the calling thread; async callers should go through
    /// [`StoreLock::acquire_async`].
    pub fn acquire(paths: &NobyPaths, mode: LockMode, command: &str) -> NobyResult<Self> {
        let (file, lock_path) = open_lock_file(paths)?;

        let operation = match mode {
            LockMode::Shared => FlockOperation::LockShared,
            LockMode::Exclusive => FlockOperation::LockExclusive,
        };
        flock(file.as_fd(), operation).map_err(|e| NobyError::Io(e.into()))?;

        Self::held(file, lock_path, mode, command)
    }

    /// Acquire the lock without blocking the async runtime.
    pub async fn acquire_async(paths: &NobyPaths, mode: LockMode, command: &str) -> NobyResult<Self> {
        let paths = paths.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || Self::acquire(&paths, mode, &command))
            .await
            .map_err(|e| NobyError::Internal {
                message: format!("lock task failed: {e}"),
            })?
    }

    /// Try to take the lock, failing with [`NobyError::Locked`] on contention.
    pub fn try_acquire(paths: &NobyPaths, mode: LockMode, command: &str) -> NobyResult<Self> {
        let (file, lock_path) = open_lock_file(paths)?;

        let operation = match mode {
            LockMode::Shared => FlockOperation::NonBlockingLockShared,
            LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
        };

        if let Err(err) = flock(file.as_fd(), operation) {
            let err: io::Error = err.into();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(NobyError::Locked {
                    holder: describe_holder(&lock_path),
                });
            }
            return Err(err.into());
        }

        Self::held(file, lock_path, mode, command)
    }

    fn held(file: File, lock_path: PathBuf, mode: LockMode, command: &str) -> NobyResult<Self> {
        if mode == LockMode::Exclusive {
            write_metadata(&file, command)?;
        }

        tracing::debug!(path = %lock_path.display(), ?mode, command, "Store lock acquired");
        Ok(Self {
            file,
            lock_path,
            mode,
        })
    }

    /// Read the metadata through the held handle.
    pub fn read_metadata(&self) -> io::Result<LockMetadata> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        serde_json::from_str(&contents).map_err(io::Error::other)
    }

    /// Path of the lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Mode the lock is held in.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

fn open_lock_file(paths: &NobyPaths) -> NobyResult<(File, PathBuf)> {
    std::fs::create_dir_all(&paths.root)?;
    let lock_path = paths.lock_file();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    Ok((file, lock_path))
}

fn write_metadata(file: &File, command: &str) -> NobyResult<()> {
    let metadata = LockMetadata {
        pid: std::process::id(),
        started_at: Utc::now(),
        command: command.to_string(),
    };

    file.set_len(0)?;
    let mut writer = io::BufWriter::new(file);
    writer.seek(SeekFrom::Start(0))?;
    serde_json::to_writer_pretty(&mut writer, &metadata)?;
    writer.flush()?;
    Ok(())
}

fn describe_holder(lock_path: &Path) -> String {
    std::fs::read_to_string(lock_path)
        .ok()
        .and_then(|contents| serde_json::from_str::<LockMetadata>(&contents).ok())
        .map_or_else(
            || format!("unknown holder of {}", lock_path.display()),
            |m| format!("{} (PID {}, started {})", m.command, m.pid, m.started_at),
        )
}
