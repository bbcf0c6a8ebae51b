//! Single-blob download with retry, integrity verification, and atomic
//! install.
//!
//! Each blob streams into a `.tmp` sibling, is hash-verified, and only then
//! renamed over the final path. The temp file is deleted on every failure
//! path, so a partially written blob is never observable at the final name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::constants::{
    BACKOFF_BASE, BACKOFF_CAP, BLOB_TOTAL_TIMEOUT, CHUNK_SIZE, FLUSH_INTERVAL_BYTES,
    IDLE_CHUNK_TIMEOUT, MAX_ATTEMPTS, TEMP_SUFFIX,
};
use super::error::FetchError;
use super::manifest::BlobDescriptor;
use super::progress::ProgressTracker;
use crate::hash::sha256_file;

/// Tunable retry/timeout knobs for blob downloads and the orchestration
/// wrapper. Defaults carry the production values; tests inject shorter ones.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Attempts per blob and per whole-model orchestration.
    pub max_attempts: u32,
    /// Base retry interval; also the flat wait after 401/403/404.
    pub backoff_base: Duration,
    /// Upper bound on the exponential retry interval.
    pub backoff_cap: Duration,
    /// Abort a transfer when no chunk arrives for this long.
    pub idle_timeout: Duration,
    /// Whole-request budget for one blob GET.
    pub total_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
            idle_timeout: IDLE_CHUNK_TIMEOUT,
            total_timeout: BLOB_TOTAL_TIMEOUT,
        }
    }
}

impl FetchOptions {
    /// Delay before the attempt following `attempt` (0-indexed).
    ///
    /// Auth and not-found statuses get exactly one base interval; every
    /// other failure backs off exponentially up to the cap.
    #[must_use]
    pub fn backoff_delay(&self, status: Option<u16>, attempt: u32) -> Duration {
        if matches!(status, Some(401 | 403 | 404)) {
            return self.backoff_base;
        }
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// One attempt's failure, carrying the status code when the gateway answered.
struct AttemptFailure {
    status: Option<u16>,
    reason: String,
}

/// Downloads `blob` into `dir`, verifying its content hash.
///
/// Returns the final installed path. If the final path already exists with a
/// matching hash the download is skipped entirely; a stale file is unlinked
/// and re-fetched.
///
/// # Errors
///
/// Returns [`FetchError::Blob`] after `max_attempts` failed attempts; the
/// variant carries the last failure's description.
pub async fn download_blob(
    client: &Client,
    gateway_base: &str,
    blob: &BlobDescriptor,
    dir: &Path,
    tracker: Option<Arc<ProgressTracker>>,
    options: &FetchOptions,
) -> Result<PathBuf, FetchError> {
    let final_path = dir.join(&blob.file_name);
    let temp_path = dir.join(format!("{}{TEMP_SUFFIX}", blob.file_name));

    // Fast path: an installed blob with the right hash needs no network I/O.
    if final_path.exists() {
        match sha256_file(&final_path).await {
            Ok(digest) if digest == blob.file_hash => {
                debug!(cid = %blob.cid, "blob already installed with matching hash");
                return Ok(final_path);
            }
            Ok(_) => {
                warn!(cid = %blob.cid, "existing blob hash mismatch, re-downloading");
                let _ = fs::remove_file(&final_path).await;
            }
            Err(e) => {
                warn!(cid = %blob.cid, error = %e, "could not verify existing blob, re-downloading");
                let _ = fs::remove_file(&final_path).await;
            }
        }
    }
    // A temp file from a previous crash is garbage by definition.
    let _ = fs::remove_file(&temp_path).await;

    let url = format!("{gateway_base}{}", blob.cid);
    let mut last_failure = AttemptFailure {
        status: None,
        reason: "no attempt made".to_string(),
    };

    for attempt in 0..options.max_attempts {
        match download_attempt(client, &url, blob, &final_path, &temp_path, tracker.as_ref(), options)
            .await
        {
            Ok(()) => {
                info!(cid = %blob.cid, path = %final_path.display(), "blob downloaded and verified");
                return Ok(final_path);
            }
            Err(failure) => {
                warn!(
                    cid = %blob.cid,
                    attempt = attempt + 1,
                    max_attempts = options.max_attempts,
                    reason = %failure.reason,
                    "blob attempt failed"
                );
                let _ = fs::remove_file(&temp_path).await;
                let delay = options.backoff_delay(failure.status, attempt);
                last_failure = failure;
                if attempt + 1 < options.max_attempts {
                    debug!(cid = %blob.cid, delay_secs = delay.as_secs_f64(), "backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let _ = fs::remove_file(&temp_path).await;
    Err(FetchError::blob(
        &blob.cid,
        options.max_attempts,
        last_failure.reason,
    ))
}

async fn download_attempt(
    client: &Client,
    url: &str,
    blob: &BlobDescriptor,
    final_path: &Path,
    temp_path: &Path,
    tracker: Option<&Arc<ProgressTracker>>,
    options: &FetchOptions,
) -> Result<(), AttemptFailure> {
    let response = client
        .get(url)
        .timeout(options.total_timeout)
        .send()
        .await
        .map_err(|e| transport_failure(&e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AttemptFailure {
            status: Some(status.as_u16()),
            reason: format!("HTTP {status}"),
        });
    }

    if let (Some(tracker), Some(len)) = (tracker, response.content_length()) {
        if len > 0 {
            tracker.add_expected(len).await;
        }
    }

    stream_to_temp(response, temp_path, blob, tracker, options).await?;

    let digest = sha256_file(temp_path).await.map_err(|e| AttemptFailure {
        status: None,
        reason: format!("hashing {} failed: {e}", temp_path.display()),
    })?;
    if digest != blob.file_hash {
        return Err(AttemptFailure {
            status: None,
            reason: FetchError::integrity(&blob.cid, &blob.file_hash, &digest).to_string(),
        });
    }

    // Rename only after verification so the final path is never partial.
    if final_path.exists() {
        fs::remove_file(final_path)
            .await
            .map_err(|e| io_failure(final_path, &e))?;
    }
    fs::rename(temp_path, final_path)
        .await
        .map_err(|e| io_failure(temp_path, &e))?;
    Ok(())
}

async fn stream_to_temp(
    response: reqwest::Response,
    temp_path: &Path,
    blob: &BlobDescriptor,
    tracker: Option<&Arc<ProgressTracker>>,
    options: &FetchOptions,
) -> Result<(), AttemptFailure> {
    let mut file = File::create(temp_path)
        .await
        .map_err(|e| io_failure(temp_path, &e))?;
    let mut stream = response.bytes_stream();
    // Transport reads are reassembled into fixed 4 MiB blocks; every disk
    // write and progress update moves one block (or the final remainder).
    let mut block: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut bytes_since_flush: u64 = 0;

    loop {
        let next = tokio::time::timeout(options.idle_timeout, stream.next()).await;
        let chunk = match next {
            Err(_) => {
                return Err(AttemptFailure {
                    status: None,
                    reason: FetchError::idle_timeout(&blob.cid, options.idle_timeout.as_secs())
                        .to_string(),
                });
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(transport_failure(&e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let mut rest = &chunk[..];
        while !rest.is_empty() {
            let take = (CHUNK_SIZE - block.len()).min(rest.len());
            block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if block.len() == CHUNK_SIZE {
                write_block(&mut file, &block, temp_path, tracker, &mut bytes_since_flush)
                    .await?;
                block.clear();
            }
        }
    }

    if !block.is_empty() {
        write_block(&mut file, &block, temp_path, tracker, &mut bytes_since_flush).await?;
    }

    file.sync_all().await.map_err(|e| io_failure(temp_path, &e))?;
    Ok(())
}

/// Writes one block, reports its bytes, and fsyncs on the 50 MiB cadence.
async fn write_block(
    file: &mut File,
    block: &[u8],
    temp_path: &Path,
    tracker: Option<&Arc<ProgressTracker>>,
    bytes_since_flush: &mut u64,
) -> Result<(), AttemptFailure> {
    file.write_all(block)
        .await
        .map_err(|e| io_failure(temp_path, &e))?;
    *bytes_since_flush += block.len() as u64;
    if let Some(tracker) = tracker {
        tracker.update_progress(block.len() as u64).await;
    }

    if *bytes_since_flush >= FLUSH_INTERVAL_BYTES {
        file.flush().await.map_err(|e| io_failure(temp_path, &e))?;
        file.sync_data()
            .await
            .map_err(|e| io_failure(temp_path, &e))?;
        *bytes_since_flush = 0;
    }
    Ok(())
}

fn transport_failure(error: &reqwest::Error) -> AttemptFailure {
    let reason = if error.is_timeout() {
        format!("timeout: {error}")
    } else {
        format!("transport error: {error}")
    };
    AttemptFailure {
        status: None,
        reason,
    }
}

fn io_failure(path: &Path, error: &std::io::Error) -> AttemptFailure {
    AttemptFailure {
        status: None,
        reason: format!("IO error at {}: {error}", path.display()),
    }
}
