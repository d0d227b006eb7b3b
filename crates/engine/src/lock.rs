//! Single-instance lock
//!
//! A process-wide flock on `daemon.lock` in the agent home prevents two
//! agents from racing on the same local state. The lock is advisory,
//! non-blocking, and released when the guard drops (or the process dies).

use std::fs::File;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Name of the lock file inside the agent home
pub const LOCK_FILE: &str = "daemon.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another esync agent is already running (lock held on {0})")]
    AlreadyRunning(PathBuf),
    #[error("cannot create lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// RAII guard for the instance lock
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to acquire the lock, failing fast if another agent holds it.
    ///
    /// # Errors
    /// `LockError::AlreadyRunning` when the lock is held elsewhere.
    pub fn acquire(home: &Path) -> Result<Self, LockError> {
        std::fs::create_dir_all(home)?;
        let path = home.join(LOCK_FILE);
        let file = File::create(&path)?;

        #[cfg(unix)]
        {
            // SAFETY: flock on a valid, open file descriptor
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(LockError::AlreadyRunning(path));
            }
        }

        Ok(Self { file, path })
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: unlocking a descriptor we still own
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        let _ = &self.file;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let home = tempfile::tempdir().unwrap();
        let lock = InstanceLock::acquire(home.path()).unwrap();
        assert!(lock.path().exists());

        // Second acquisition in the same process still conflicts on unix
        #[cfg(unix)]
        assert!(matches!(
            InstanceLock::acquire(home.path()),
            Err(LockError::AlreadyRunning(_))
        ));

        drop(lock);
        let relocked = InstanceLock::acquire(home.path());
        assert!(relocked.is_ok());
    }
}
