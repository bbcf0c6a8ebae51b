//! Whole-model fetch orchestration.
//!
//! Resolves the manifest, fans the blob set out over a shared HTTP session
//! bounded by a counting semaphore, then extracts, relocates, and cleans up.
//! The entire flow is wrapped in its own retry loop; a single failed blob
//! fails the attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::blob::{FetchOptions, download_blob};
use super::constants::{
    CONNECT_TIMEOUT, CONNECTION_POOL_SIZE, MAX_CONCURRENT_DOWNLOADS, MIN_CONCURRENT_DOWNLOADS,
    PROJECTOR_SUFFIX, READ_TIMEOUT,
};
use super::error::FetchError;
use super::manifest::{Manifest, fetch_manifest};
use super::progress::ProgressTracker;
use crate::config::Settings;
use crate::fsops;

/// Concurrency ceiling for a manifest of `num_of_files` blobs:
/// `min(16, max(4, num_of_files))`.
#[must_use]
pub fn concurrency_limit(num_of_files: usize) -> usize {
    MAX_CONCURRENT_DOWNLOADS.min(MIN_CONCURRENT_DOWNLOADS.max(num_of_files))
}

/// Fetches model packages from the content gateway into the storage
/// directory.
#[derive(Debug, Clone)]
pub struct ModelFetcher {
    settings: Settings,
    options: FetchOptions,
}

impl ModelFetcher {
    /// Creates a fetcher with the default retry/timeout options.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self::with_options(settings, FetchOptions::default())
    }

    /// Creates a fetcher with explicit options (tests use short timings).
    #[must_use]
    pub fn with_options(settings: Settings, options: FetchOptions) -> Self {
        Self { settings, options }
    }

    /// Ensures the model for `hash` is installed and returns its path.
    ///
    /// If `<output_dir>/<hash>.gguf` already exists it is returned without
    /// network I/O.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] after exhausting the orchestration
    /// retry budget.
    pub async fn fetch(&self, hash: &str) -> Result<PathBuf, FetchError> {
        let local_path = self.settings.model_path(hash);
        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .map_err(|e| FetchError::io(&self.settings.output_dir, e))?;

        if local_path.exists() {
            info!(hash, path = %local_path.display(), "model already present");
            return Ok(local_path);
        }

        let mut last_error: Option<FetchError> = None;
        for attempt in 0..self.options.max_attempts {
            match self.fetch_attempt(hash, &local_path).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    error!(hash, attempt = attempt + 1, error = %e, "model fetch attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < self.options.max_attempts {
                        let delay = self.options.backoff_delay(None, attempt);
                        debug!(hash, delay_secs = delay.as_secs_f64(), "retrying orchestration");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| FetchError::blob(hash, self.options.max_attempts, "no attempt made")))
    }

    async fn fetch_attempt(&self, hash: &str, local_path: &Path) -> Result<PathBuf, FetchError> {
        let manifest = fetch_manifest(&self.settings, hash).await?;

        let workdir = self.settings.work_dir.join(&manifest.folder_name);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| FetchError::io(&workdir, e))?;

        let paths = self.download_blobs(&manifest, &workdir).await?;

        fsops::extract_archives(&paths)
            .await
            .map_err(|e| FetchError::Extract {
                path: workdir.clone(),
                source: e,
            })?;

        let source = workdir.join(&manifest.folder_name);
        if !source.exists() {
            return Err(FetchError::ModelMissing { path: source });
        }

        let projector_source = workdir.join(format!("{}{PROJECTOR_SUFFIX}", manifest.folder_name));
        if projector_source.exists() {
            let mut projector_dest = local_path.to_path_buf().into_os_string();
            projector_dest.push(PROJECTOR_SUFFIX);
            let projector_dest = PathBuf::from(projector_dest);
            info!(hash, dest = %projector_dest.display(), "installing multimodal projector");
            fsops::move_path(&projector_source, &projector_dest)
                .await
                .map_err(|e| FetchError::Move {
                    from: projector_source.clone(),
                    to: projector_dest,
                    source: e,
                })?;
        }

        fsops::move_path(&source, local_path)
            .await
            .map_err(|e| FetchError::Move {
                from: source.clone(),
                to: local_path.to_path_buf(),
                source: e,
            })?;

        if let Err(e) = fsops::remove_tree(&workdir).await {
            warn!(workdir = %workdir.display(), error = %e, "failed to clean working directory");
        }

        info!(hash, path = %local_path.display(), "model download complete");
        Ok(local_path.to_path_buf())
    }

    /// Downloads every blob in the manifest concurrently. Fails if any blob
    /// fails; completion order across blobs is unspecified.
    async fn download_blobs(
        &self,
        manifest: &Manifest,
        workdir: &Path,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let client = self.build_client()?;
        let limit = concurrency_limit(manifest.num_of_files);
        let semaphore = Arc::new(Semaphore::new(limit));
        let tracker = ProgressTracker::new(manifest.files.len());

        info!(
            files = manifest.files.len(),
            concurrency = limit,
            "starting blob downloads"
        );

        let mut tasks = JoinSet::new();
        for blob in manifest.files.clone() {
            let client = client.clone();
            let gateway = self.settings.manifest_gateway.clone();
            let dir = workdir.to_path_buf();
            let tracker = Arc::clone(&tracker);
            let options = self.options.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // Closed only if the semaphore is dropped, which cannot
                // happen while this task holds a clone.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(FetchError::blob(&blob.cid, 0, "semaphore closed"));
                };
                download_blob(&client, &gateway, &blob, &dir, Some(tracker), &options).await
            });
        }

        let mut installed = Vec::with_capacity(manifest.files.len());
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(path)) => {
                    installed.push(path);
                    tracker.complete_file().await;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "blob download failed");
                    failures.push(e);
                }
                Err(join_err) => {
                    error!(error = %join_err, "blob task panicked");
                    failures.push(FetchError::blob("unknown", 0, join_err.to_string()));
                }
            }
        }
        tracker.cleanup().await;

        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }
        if installed.len() != manifest.num_of_files {
            return Err(FetchError::blob(
                &manifest.filecoin_hash,
                self.options.max_attempts,
                format!(
                    "downloaded {} of {} files",
                    installed.len(),
                    manifest.num_of_files
                ),
            ));
        }
        Ok(installed)
    }

    fn build_client(&self) -> Result<Client, FetchError> {
        Client::builder()
            .pool_max_idle_per_host(CONNECTION_POOL_SIZE)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .danger_accept_invalid_certs(self.settings.accept_invalid_certs)
            .build()
            .map_err(|e| {
                FetchError::blob(
                    &self.settings.manifest_gateway,
                    0,
                    format!("failed to build HTTP session: {e}"),
                )
            })
    }
}
