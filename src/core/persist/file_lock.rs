// src/core/persist/file_lock.rs

//! RAII guard around a POSIX `flock` on a sidecar lock file. The lock is
//! acquired on construction and released (with the descriptor closed) on
//! drop, so every early-return path unlocks correctly.

use crate::core::errors::ControllerError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Holds an exclusive `flock` for its lifetime.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

#[cfg(unix)]
fn flock(file: &File, flags: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), flags) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl FileLockGuard {
    #[cfg(unix)]
    fn open_lock_file(path: &Path) -> Result<File, ControllerError> {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                ControllerError::PersistFailure(format!(
                    "failed to open lock file '{}': {e}",
                    path.display()
                ))
            })
    }

    /// Blocks until the exclusive lock is held.
    #[cfg(unix)]
    pub fn acquire(path: &Path) -> Result<Self, ControllerError> {
        let file = Self::open_lock_file(path)?;
        flock(&file, libc::LOCK_EX).map_err(|e| {
            ControllerError::PersistFailure(format!(
                "failed to lock '{}': {e}",
                path.display()
            ))
        })?;
        debug!("acquired file lock on {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Non-blocking variant: `Ok(None)` when another process holds the lock.
    #[cfg(unix)]
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, ControllerError> {
        let file = Self::open_lock_file(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ControllerError::PersistFailure(format!(
                "failed to lock '{}': {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(unix)]
impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
        debug!("released file lock on {}", self.path.display());
    }
}
