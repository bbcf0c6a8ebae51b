//! Error types for the service lifecycle.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::SettingsError;
use crate::fetch::FetchError;

/// Errors that can occur while starting or stopping the service pair.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The requested API port already accepts connections.
    #[error("port {port} is already in use on {host}")]
    PortInUse {
        /// Host the probe connected to.
        host: String,
        /// The occupied port.
        port: u16,
    },

    /// Another start is in flight, held by a live process.
    #[error("another start is already running (PID {pid})")]
    AlreadyStarting {
        /// PID read from the lock file.
        pid: u32,
    },

    /// A lock file owned by a dead process was found and removed.
    #[error("stale start lock removed; retry the operation")]
    StaleLock,

    /// Lock file manipulation failed at the OS level.
    #[error("start lock error: {source}")]
    LockIo {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The health endpoint never reported ready within the budget.
    #[error("service on port {port} not healthy after {budget_secs}s: {last_error}")]
    HealthTimeout {
        /// Port that was probed.
        port: u16,
        /// Total budget that elapsed.
        budget_secs: u64,
        /// Description of the last probe failure.
        last_error: String,
    },

    /// A child process failed to spawn.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        /// Logical child name (backend or API).
        name: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A process survived the termination escalation.
    #[error("could not terminate {name} (PID {pid})")]
    Termination {
        /// Logical child name.
        name: String,
        /// The stubborn PID.
        pid: u32,
    },

    /// The installed artifact is missing from its expected path.
    #[error("model file not found at {path}")]
    ModelNotFound {
        /// Expected artifact path.
        path: PathBuf,
    },

    /// Supervision record could not be read or written.
    #[error("supervision record error: {source}")]
    Record {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Posting the record to the API's update endpoint failed.
    #[error("failed to update API metadata: {source}")]
    Update {
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Configuration could not be resolved.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The model fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ServiceError {
    /// Creates a record error from an I/O failure.
    pub fn record(source: std::io::Error) -> Self {
        Self::Record { source }
    }

    /// Creates a lock error from an I/O failure.
    pub fn lock_io(source: std::io::Error) -> Self {
        Self::LockIo { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_starting_names_pid() {
        let err = ServiceError::AlreadyStarting { pid: 4242 };
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_port_in_use_names_host_and_port() {
        let err = ServiceError::PortInUse {
            host: "127.0.0.1".to_string(),
            port: 11434,
        };
        let msg = err.to_string();
        assert!(msg.contains("11434"), "expected port in: {msg}");
        assert!(msg.contains("127.0.0.1"), "expected host in: {msg}");
    }
}
