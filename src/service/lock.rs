//! Cross-process start lock.
//!
//! Only one start may proceed machine-wide. The lock is an advisory
//! exclusive `flock(2)` on a well-known file whose content is the holder's
//! PID. Acquisition is strictly non-blocking: a conflict with a live holder
//! fails fast, a conflict with a dead holder removes the stale file and
//! asks the caller to retry.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::ServiceError;
use super::process::pid_alive;

/// Guard for the exclusive start lock. Releases the descriptor and unlinks
/// the lock file when dropped, whatever the outcome of the start body.
#[derive(Debug)]
pub struct StartLock {
    path: PathBuf,
    // Held open for the lifetime of the guard; the flock rides on this fd.
    _file: File,
}

impl StartLock {
    /// Attempts to acquire the start lock at `path`.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::AlreadyStarting`] when a live process holds the
    ///   lock (its PID is reported).
    /// - [`ServiceError::StaleLock`] when the holder recorded in the file is
    ///   dead or unreadable; the stale file is removed before returning.
    /// - [`ServiceError::LockIo`] for any other OS-level failure.
    pub fn acquire(path: &Path) -> Result<Self, ServiceError> {
        // No truncate here: on conflict the holder's PID must stay readable.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(ServiceError::lock_io)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let os_err = io::Error::last_os_error();
            if os_err.kind() != io::ErrorKind::WouldBlock {
                return Err(ServiceError::lock_io(os_err));
            }
            return Err(Self::classify_conflict(path));
        }

        file.set_len(0).map_err(ServiceError::lock_io)?;
        file.write_all(std::process::id().to_string().as_bytes())
            .map_err(ServiceError::lock_io)?;
        file.sync_all().map_err(ServiceError::lock_io)?;
        debug!(path = %path.display(), "start lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Decides between a live holder and a stale file.
    fn classify_conflict(path: &Path) -> ServiceError {
        let holder = fs::read_to_string(path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok());
        match holder {
            Some(pid) if pid_alive(pid) => {
                warn!(pid, "start lock held by a live process");
                ServiceError::AlreadyStarting { pid }
            }
            _ => {
                warn!(path = %path.display(), "removing stale start lock");
                let _ = fs::remove_file(path);
                ServiceError::StaleLock
            }
        }
    }
}

impl Drop for StartLock {
    fn drop(&mut self) {
        // The descriptor closes with the guard; unlink so no lock file
        // outlives a start call.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove start lock");
            }
        } else {
            debug!(path = %self.path.display(), "start lock released");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        let _lock = StartLock::acquire(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_reports_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        let _held = StartLock::acquire(&path).unwrap();
        let second = StartLock::acquire(&path);

        match second {
            Err(ServiceError::AlreadyStarting { pid }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyStarting, got {other:?}"),
        }
        assert!(path.exists(), "live holder's lock file must survive");
    }

    #[test]
    fn test_drop_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        {
            let _lock = StartLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists(), "lock file must be unlinked on release");
    }

    #[test]
    fn test_reacquire_after_release_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        drop(StartLock::acquire(&path).unwrap());
        let second = StartLock::acquire(&path);
        assert!(second.is_ok(), "lock must be reacquirable after release");
    }

    #[test]
    fn test_conflict_with_dead_holder_is_stale_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        // Hold the flock on a separate descriptor while the file names a
        // PID that cannot exist, simulating a crashed holder whose lock fd
        // leaked to a still-running descendant.
        let blocker = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert_eq!(
            unsafe { libc::flock(blocker.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) },
            0
        );
        fs::write(&path, "999999999").unwrap();

        match StartLock::acquire(&path) {
            Err(ServiceError::StaleLock) => {}
            other => panic!("expected StaleLock, got {other:?}"),
        }
        assert!(!path.exists(), "stale lock file must be removed");
    }

    #[test]
    fn test_conflict_with_unreadable_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.lock");

        let blocker = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert_eq!(
            unsafe { libc::flock(blocker.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) },
            0
        );
        fs::write(&path, "not-a-pid").unwrap();

        match StartLock::acquire(&path) {
            Err(ServiceError::StaleLock) => {}
            other => panic!("expected StaleLock, got {other:?}"),
        }
    }
}
