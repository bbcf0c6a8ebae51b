//! Error types for the fetch module.
//!
//! Transport and integrity failures are retried inside the fetcher; only
//! exhausted retries surface through these variants.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while materializing a model package.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The gateway did not return 200 for the top-level manifest.
    #[error("manifest unavailable at {url}: HTTP {status}")]
    Manifest {
        /// Manifest URL that failed.
        url: String,
        /// The HTTP status received.
        status: u16,
    },

    /// Transport-level failure fetching or parsing the manifest.
    #[error("manifest request failed for {url}: {source}")]
    ManifestTransport {
        /// Manifest URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// A blob could not be installed after exhausting retries.
    #[error("blob {cid} failed after {attempts} attempts: {reason}")]
    Blob {
        /// Content address of the failed blob.
        cid: String,
        /// How many attempts were made.
        attempts: u32,
        /// Description of the last error.
        reason: String,
    },

    /// Downloaded bytes did not reproduce the descriptor hash.
    #[error("integrity failure for {cid}: expected {expected}, got {actual}")]
    Integrity {
        /// Content address of the blob.
        cid: String,
        /// Hash the descriptor promised.
        expected: String,
        /// Hash the bytes produced.
        actual: String,
    },

    /// No data arrived on the stream for the idle budget.
    #[error("idle timeout for {cid}: no data for {idle_secs}s")]
    IdleTimeout {
        /// Content address of the blob.
        cid: String,
        /// The idle budget that elapsed.
        idle_secs: u64,
    },

    /// Archive extraction failed after download.
    #[error("failed to extract {path}: {source}")]
    Extract {
        /// Archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Moving the assembled artifact into place failed.
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The assembled artifact was not where the manifest said it would be.
    #[error("model not found at {path} after download")]
    ModelMissing {
        /// Expected artifact path.
        path: PathBuf,
    },

    /// Local filesystem error during streaming or verification.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Creates a manifest status error.
    pub fn manifest(url: impl Into<String>, status: u16) -> Self {
        Self::Manifest {
            url: url.into(),
            status,
        }
    }

    /// Creates a manifest transport error.
    pub fn manifest_transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::ManifestTransport {
            url: url.into(),
            source,
        }
    }

    /// Creates a blob failure.
    pub fn blob(cid: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        Self::Blob {
            cid: cid.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Creates an integrity failure.
    pub fn integrity(
        cid: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            cid: cid.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an idle-timeout failure.
    pub fn idle_timeout(cid: impl Into<String>, idle_secs: u64) -> Self {
        Self::IdleTimeout {
            cid: cid.into(),
            idle_secs,
        }
    }

    /// Creates an I/O failure tagged with the affected path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_error_names_cid_and_attempts() {
        let err = FetchError::blob("QmB", 2, "HTTP 503");
        let msg = err.to_string();
        assert!(msg.contains("QmB"), "expected cid in: {msg}");
        assert!(msg.contains("2 attempts"), "expected attempts in: {msg}");
        assert!(msg.contains("503"), "expected reason in: {msg}");
    }

    #[test]
    fn test_integrity_error_shows_both_hashes() {
        let err = FetchError::integrity("QmB", "aa", "bb");
        let msg = err.to_string();
        assert!(msg.contains("expected aa"), "expected hash in: {msg}");
        assert!(msg.contains("got bb"), "actual hash in: {msg}");
    }

    #[test]
    fn test_idle_timeout_names_budget() {
        let err = FetchError::idle_timeout("QmB", 180);
        assert!(err.to_string().contains("180s"));
    }
}
