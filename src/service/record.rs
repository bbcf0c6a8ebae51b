//! The persisted supervision record.
//!
//! A single JSON file snapshots the running service pair. Only start writes
//! it, only stop deletes it, and the write is atomic (temp sibling +
//! rename) so a crash never leaves a half-written record. The format is
//! versioned and schema-explicit so other tooling can read it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// Current record schema version.
pub const RECORD_VERSION: u32 = 1;

/// Snapshot of the running service pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Schema version of this file.
    pub version: u32,
    /// Content address of the running model.
    pub hash: String,
    /// Backend's ephemeral port.
    pub port: u16,
    /// Front-end API port.
    pub app_port: u16,
    /// Installed model artifact path.
    pub local_text_path: PathBuf,
    /// Sibling projector path; `None` for text-only models.
    pub local_projector_path: Option<PathBuf>,
    /// Whether a projector is present.
    pub multimodal: bool,
    /// Effective context length the backend was started with.
    pub context_length: u32,
    /// Model family tag.
    pub family: String,
    /// Advisory memory hint in GiB.
    pub ram: f64,
    /// The backend argv as spawned.
    pub running_ai_command: Vec<String>,
    /// Backend process id.
    pub pid: u32,
    /// API process id.
    pub app_pid: u32,
    /// Seconds since epoch at record creation.
    pub last_activity: u64,
}

impl ServiceRecord {
    /// Current wall-clock time as seconds since the epoch.
    #[must_use]
    pub fn now_epoch_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Atomically writes the record to `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the temp sibling is removed on
    /// failure.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        if let Err(e) = fs::write(&temp, &bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        debug!(path = %path.display(), hash = %self.hash, "supervision record written");
        Ok(())
    }

    /// Loads the record from `path`; `None` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error for anything other than a missing
    /// file, including a record that fails to parse.
    pub async fn load(path: &Path) -> io::Result<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record: Self = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
        Ok(Some(record))
    }

    /// Removes the record file. Returns false when it was already gone.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error for anything other than a missing
    /// file.
    pub async fn remove(path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "supervision record removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
