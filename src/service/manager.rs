//! Service pair lifecycle: start, stop, restart, and status.
//!
//! `start` is serialized machine-wide by the start lock. It materializes
//! the model, spawns the inference backend and the front-end API in their
//! own process groups, confirms both healthy, persists the supervision
//! record, and hands the record to the API. `stop` walks the record's PIDs
//! through the termination escalation and removes the record. Any failure
//! after a spawn tears down whatever was started; the record is never
//! persisted for a half-started pair.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use super::command::plan_backend_command;
use super::error::ServiceError;
use super::health::{HealthOptions, wait_for_health};
use super::lock::StartLock;
use super::process::{GRACEFUL_TIMEOUT, spawn_in_group, terminate_tree};
use super::record::{RECORD_VERSION, ServiceRecord};
use crate::config::Settings;
use crate::fetch::{FetchOptions, ModelFetcher, constants::PROJECTOR_SUFFIX};

/// Default bind host for both children.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default front-end API port.
pub const DEFAULT_APP_PORT: u16 = 11434;

/// Default context length requested from the backend.
pub const DEFAULT_CONTEXT_LENGTH: u32 = 32768;

/// TCP probe timeout when checking whether a port is taken.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts when verifying ports are released after stop.
const PORT_FREE_RETRIES: u32 = 5;

/// Spacing between port-release checks.
const PORT_FREE_DELAY: Duration = Duration::from_secs(1);

/// Pause between termination and port verification, letting the OS reap.
const STOP_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Timeout for the record POST to the API.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry policy for the family metadata GET.
#[derive(Debug, Clone)]
pub struct MetadataRetry {
    /// Total attempts.
    pub retries: u32,
    /// First inter-attempt delay; grows 1.5x per attempt.
    pub delay: Duration,
    /// Ceiling on the inter-attempt delay.
    pub cap: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for MetadataRetry {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(5),
            cap: Duration::from_secs(8),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Family metadata attached to a model hash.
#[derive(Debug, Clone, Default)]
struct FamilyMetadata {
    family: String,
    folder_name: String,
    ram: f64,
}

/// Supervises the backend/API process pair for one install directory.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    settings: Settings,
    fetcher: ModelFetcher,
    health: HealthOptions,
    metadata_retry: MetadataRetry,
}

impl ServiceManager {
    /// Creates a manager with production timings.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self::with_options(
            settings,
            FetchOptions::default(),
            HealthOptions::default(),
            MetadataRetry::default(),
        )
    }

    /// Creates a manager with explicit timings (tests use short ones).
    #[must_use]
    pub fn with_options(
        settings: Settings,
        fetch: FetchOptions,
        health: HealthOptions,
        metadata_retry: MetadataRetry,
    ) -> Self {
        let fetcher = ModelFetcher::with_options(settings.clone(), fetch);
        Self {
            settings,
            fetcher,
            health,
            metadata_retry,
        }
    }

    /// Starts the service pair for `hash`.
    ///
    /// Idempotent: when the running record already refers to `hash`,
    /// returns Ok without spawning anything. A record for a different hash
    /// is stopped first.
    ///
    /// # Errors
    ///
    /// Any [`ServiceError`]; whatever was spawned before the failure is
    /// terminated, and no record is persisted.
    pub async fn start(
        &self,
        hash: &str,
        app_port: u16,
        host: &str,
        context_length: u32,
    ) -> Result<(), ServiceError> {
        let _lock = StartLock::acquire(&self.settings.lock_file)?;
        info!(hash, app_port, "starting local AI service");

        // Fail before any expensive work if the API port is taken.
        if port_in_use(host, app_port) {
            return Err(ServiceError::PortInUse {
                host: host.to_string(),
                port: app_port,
            });
        }

        let model_path = self.fetcher.fetch(hash).await?;
        let mut projector_path = model_path.clone().into_os_string();
        projector_path.push(PROJECTOR_SUFFIX);
        let projector_path = std::path::PathBuf::from(projector_path);

        match self.get_running_model().await {
            Some(running) if running == hash => {
                warn!(hash, "model already running, nothing to do");
                return Ok(());
            }
            Some(running) => {
                info!(previous = %running, "stopping previously running model");
                self.stop().await?;
            }
            None => {}
        }

        if !model_path.exists() {
            return Err(ServiceError::ModelNotFound { path: model_path });
        }

        let metadata = self.load_or_fetch_metadata(hash, &model_path).await;
        let backend_port = free_port().map_err(|e| ServiceError::Spawn {
            name: "backend",
            source: e,
        })?;

        let plan = plan_backend_command(
            &self.settings.llama_server,
            &self.settings.resource_dir,
            &model_path,
            backend_port,
            host,
            context_length,
            &metadata.folder_name,
        )
        .map_err(|e| ServiceError::Spawn {
            name: "backend",
            source: e,
        })?;

        let mut argv = plan.argv;
        let multimodal = projector_path.exists();
        if multimodal {
            argv.push("--mmproj".to_string());
            argv.push(projector_path.display().to_string());
        }

        info!(command = %argv.join(" "), "spawning inference backend");
        let backend = spawn_in_group(&argv, &self.settings.log_dir.join("ai.log"), "backend")?;
        let backend_pid = backend.id();

        if let Err(e) = wait_for_health(backend_port, &self.health).await {
            error!(error = %e, "backend never became healthy");
            terminate_tree(backend_pid, "backend", GRACEFUL_TIMEOUT).await;
            return Err(e);
        }
        info!(port = backend_port, "inference backend healthy");

        let api_argv = vec![
            self.settings.api_server.display().to_string(),
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            app_port.to_string(),
            "--log-level".to_string(),
            "info".to_string(),
        ];
        info!(command = %api_argv.join(" "), "spawning API front-end");
        let api = match spawn_in_group(&api_argv, &self.settings.log_dir.join("api.log"), "api") {
            Ok(child) => child,
            Err(e) => {
                terminate_tree(backend_pid, "backend", GRACEFUL_TIMEOUT).await;
                return Err(e);
            }
        };
        let api_pid = api.id();

        if let Err(e) = wait_for_health(app_port, &self.health).await {
            error!(error = %e, "API never became healthy");
            terminate_tree(backend_pid, "backend", GRACEFUL_TIMEOUT).await;
            terminate_tree(api_pid, "api", GRACEFUL_TIMEOUT).await;
            return Err(e);
        }
        info!(port = app_port, "API front-end healthy");

        // Re-check the projector on disk so the record reflects reality at
        // persist time.
        let multimodal = projector_path.exists();
        let record = ServiceRecord {
            version: RECORD_VERSION,
            hash: hash.to_string(),
            port: backend_port,
            app_port,
            local_text_path: model_path,
            local_projector_path: multimodal.then_some(projector_path),
            multimodal,
            context_length: plan.context_length,
            family: metadata.family,
            ram: metadata.ram,
            running_ai_command: argv,
            pid: backend_pid,
            app_pid: api_pid,
            last_activity: ServiceRecord::now_epoch_secs(),
        };

        if let Err(e) = record.save(&self.settings.record_file).await {
            error!(error = %e, "failed to persist supervision record");
            terminate_tree(backend_pid, "backend", GRACEFUL_TIMEOUT).await;
            terminate_tree(api_pid, "api", GRACEFUL_TIMEOUT).await;
            return Err(ServiceError::record(e));
        }

        if let Err(e) = self.post_update(&record).await {
            error!(error = %e, "failed to hand record to the API, rolling back");
            let _ = self.stop().await;
            return Err(e);
        }

        info!(hash, app_port, backend_port, "service pair started");
        Ok(())
    }

    /// Stops the running service pair.
    ///
    /// Returns Ok(false) when there is nothing to stop. Missing PIDs and
    /// zombies count as terminated; ports still lingering after the
    /// verification retries only produce a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Record`] when an existing record cannot be
    /// read.
    pub async fn stop(&self) -> Result<bool, ServiceError> {
        let Some(record) = ServiceRecord::load(&self.settings.record_file)
            .await
            .map_err(ServiceError::record)?
        else {
            warn!("no running AI service to stop");
            return Ok(false);
        };

        info!(
            hash = %record.hash,
            pid = record.pid,
            app_pid = record.app_pid,
            "stopping AI service"
        );

        let backend_stopped = terminate_tree(record.pid, "backend", GRACEFUL_TIMEOUT).await;
        let api_stopped = terminate_tree(record.app_pid, "api", GRACEFUL_TIMEOUT).await;

        tokio::time::sleep(STOP_SETTLE_DELAY).await;

        for (port, name) in [(record.app_port, "api"), (record.port, "backend")] {
            if !wait_port_free("localhost", port).await {
                warn!(name, port, "port still in use after stop");
            }
        }

        let record_removed = match ServiceRecord::remove(&self.settings.record_file).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "failed to remove supervision record");
                false
            }
        };

        let success = backend_stopped && api_stopped && record_removed;
        if success {
            info!("AI service stopped");
        } else {
            error!(
                backend_stopped,
                api_stopped, record_removed, "stop completed with failures"
            );
        }
        Ok(success)
    }

    /// Restarts the recorded service with its original parameters.
    ///
    /// Returns Ok(false) when no record exists.
    ///
    /// # Errors
    ///
    /// Propagates errors from `stop` and `start`.
    pub async fn restart(&self) -> Result<bool, ServiceError> {
        let Some(record) = ServiceRecord::load(&self.settings.record_file)
            .await
            .map_err(ServiceError::record)?
        else {
            warn!("no running AI service to restart");
            return Ok(false);
        };

        info!(hash = %record.hash, app_port = record.app_port, "restarting AI service");
        self.stop().await?;
        self.start(
            &record.hash,
            record.app_port,
            DEFAULT_HOST,
            record.context_length,
        )
        .await?;
        Ok(true)
    }

    /// Hash of the currently recorded model, or `None` without a record.
    pub async fn get_running_model(&self) -> Option<String> {
        match ServiceRecord::load(&self.settings.record_file).await {
            Ok(record) => record.map(|r| r.hash),
            Err(e) => {
                error!(error = %e, "failed to read supervision record");
                None
            }
        }
    }

    /// Loads family metadata from the sidecar next to the model, falling
    /// back to the metadata gateway (and caching the result, best-effort).
    async fn load_or_fetch_metadata(&self, hash: &str, model_path: &Path) -> FamilyMetadata {
        let model_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
        let sidecar = model_dir.join(format!("{hash}.json"));

        if let Ok(raw) = tokio::fs::read_to_string(&sidecar).await {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => {
                    info!(path = %sidecar.display(), "loaded model metadata");
                    return Self::metadata_from_value(&value);
                }
                Err(e) => warn!(path = %sidecar.display(), error = %e, "unreadable metadata sidecar"),
            }
        }

        let Some(value) = self.fetch_metadata(hash).await else {
            warn!(hash, "no family metadata available, using defaults");
            return FamilyMetadata {
                ram: 20.0,
                ..FamilyMetadata::default()
            };
        };

        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&sidecar, bytes).await {
                    warn!(path = %sidecar.display(), error = %e, "failed to cache metadata sidecar");
                } else {
                    info!(path = %sidecar.display(), "cached model metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize metadata"),
        }
        Self::metadata_from_value(&value)
    }

    /// GETs the metadata document with the small retry policy.
    async fn fetch_metadata(&self, hash: &str) -> Option<serde_json::Value> {
        let url = self.settings.metadata_url(hash);
        let client = reqwest::Client::builder()
            .timeout(self.metadata_retry.timeout)
            .danger_accept_invalid_certs(self.settings.accept_invalid_certs)
            .build()
            .ok()?;

        let mut delay = self.metadata_retry.delay;
        for attempt in 0..self.metadata_retry.retries {
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<serde_json::Value>().await {
                        Ok(value) => return Some(value),
                        Err(e) => warn!(%url, error = %e, "metadata response was not JSON"),
                    }
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "metadata request rejected");
                }
                Err(e) => warn!(%url, attempt = attempt + 1, error = %e, "metadata request failed"),
            }
            if attempt + 1 < self.metadata_retry.retries {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(1.5).min(self.metadata_retry.cap);
            }
        }
        None
    }

    fn metadata_from_value(value: &serde_json::Value) -> FamilyMetadata {
        FamilyMetadata {
            family: value
                .get("family")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            folder_name: value
                .get("folder_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ram: value.get("ram").and_then(serde_json::Value::as_f64).unwrap_or(20.0),
        }
    }

    /// POSTs the record to the API's update endpoint.
    async fn post_update(&self, record: &ServiceRecord) -> Result<(), ServiceError> {
        let url = format!("http://localhost:{}/update", record.app_port);
        let client = reqwest::Client::builder()
            .timeout(UPDATE_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Update { source: e })?;
        client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| ServiceError::Update { source: e })?
            .error_for_status()
            .map_err(|e| ServiceError::Update { source: e })?;
        Ok(())
    }
}

/// Host actually probed: a wildcard bind address is reached via loopback.
fn probe_host(host: &str) -> &str {
    if host == "0.0.0.0" { "127.0.0.1" } else { host }
}

/// True when something is accepting connections on `host:port`.
#[must_use]
pub fn port_in_use(host: &str, port: u16) -> bool {
    use std::net::ToSocketAddrs;
    let Ok(mut addrs) = (probe_host(host), port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|addr| TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok())
}

/// Allocates a free ephemeral port by binding to port 0.
///
/// # Errors
///
/// Returns the underlying I/O error when no socket can be bound.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Polls until `host:port` stops accepting connections, with bounded
/// retries.
async fn wait_port_free(host: &str, port: u16) -> bool {
    for attempt in 0..PORT_FREE_RETRIES {
        if !port_in_use(host, port) {
            return true;
        }
        if attempt + 1 < PORT_FREE_RETRIES {
            tokio::time::sleep(PORT_FREE_DELAY).await;
        }
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_connectable_after_bind_release() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // Released on listener drop, so nothing should be accepting.
        assert!(!port_in_use("127.0.0.1", port));
    }

    #[test]
    fn test_port_in_use_detects_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use("127.0.0.1", port));
        assert!(port_in_use("0.0.0.0", port), "wildcard host probes loopback");
    }

    #[test]
    fn test_metadata_from_value_defaults() {
        let value = serde_json::json!({});
        let metadata = ServiceManager::metadata_from_value(&value);
        assert_eq!(metadata.family, "");
        assert_eq!(metadata.folder_name, "");
        assert!((metadata.ram - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metadata_from_value_reads_fields() {
        let value = serde_json::json!({
            "family": "qwen3",
            "folder_name": "qwen3-4b",
            "ram": 12.5,
        });
        let metadata = ServiceManager::metadata_from_value(&value);
        assert_eq!(metadata.family, "qwen3");
        assert_eq!(metadata.folder_name, "qwen3-4b");
        assert!((metadata.ram - 12.5).abs() < f64::EPSILON);
    }
}
