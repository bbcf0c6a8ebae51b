//! Runtime configuration resolved once at startup.
//!
//! All environment access happens here; the rest of the crate receives a
//! [`Settings`] value and never reads the environment at call sites.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Default content gateway serving manifests and blobs.
pub const DEFAULT_MANIFEST_GATEWAY: &str = "https://gateway.mesh3.network/ipfs/";

/// Default gateway for model family metadata. Kept separate from the
/// manifest gateway; both are independently overridable.
pub const DEFAULT_METADATA_GATEWAY: &str = "https://gateway.lighthouse.storage/ipfs/";

/// Directory name for installed model artifacts, under the working directory.
pub const DEFAULT_STORAGE_DIR: &str = "llms-storage";

/// Errors raised while resolving [`Settings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A required executable path is missing or does not exist.
    #[error("{var} does not point to an executable ({path})")]
    MissingExecutable {
        /// Environment variable that should name the executable.
        var: &'static str,
        /// The value that was rejected.
        path: String,
    },

    /// A gateway base URL failed to parse.
    #[error("invalid gateway URL in {var}: {url}")]
    InvalidGateway {
        /// Environment variable holding the URL.
        var: &'static str,
        /// The rejected value.
        url: String,
    },
}

/// Resolved configuration for both the fetcher and the service manager.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL for manifest and blob GETs; always ends with `/`.
    pub manifest_gateway: String,
    /// Base URL for family metadata GETs; always ends with `/`.
    pub metadata_gateway: String,
    /// Skip TLS certificate verification on gateway connections.
    pub accept_invalid_certs: bool,
    /// Absolute path of the inference backend executable.
    pub llama_server: PathBuf,
    /// Front-end API server executable (spawned on the app port).
    pub api_server: PathBuf,
    /// Supervision record location; written by start, removed by stop.
    pub record_file: PathBuf,
    /// Start-lock location; exists only while a start is in flight.
    pub lock_file: PathBuf,
    /// Where installed model artifacts live.
    pub output_dir: PathBuf,
    /// Root under which package working directories are assembled.
    pub work_dir: PathBuf,
    /// Root of chat templates and best-practice files.
    pub resource_dir: PathBuf,
    /// Child process stderr logs.
    pub log_dir: PathBuf,
}

impl Settings {
    /// Resolves settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MissingExecutable`] when `LLAMA_SERVER` is
    /// unset or names a path that does not exist, and
    /// [`SettingsError::InvalidGateway`] when a gateway override is not a
    /// valid URL.
    pub fn from_env() -> Result<Self, SettingsError> {
        let llama_server = env::var("LLAMA_SERVER").unwrap_or_default();
        if llama_server.is_empty() || !PathBuf::from(&llama_server).exists() {
            return Err(SettingsError::MissingExecutable {
                var: "LLAMA_SERVER",
                path: llama_server,
            });
        }

        let manifest_gateway =
            gateway_from_env("GATEWAY_URL", DEFAULT_MANIFEST_GATEWAY)?;
        let metadata_gateway =
            gateway_from_env("METADATA_GATEWAY_URL", DEFAULT_METADATA_GATEWAY)?;

        let accept_invalid_certs = env::var("GATEWAY_ACCEPT_INVALID_CERTS")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        let output_dir = env::var_os("MODEL_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));

        Ok(Self {
            manifest_gateway,
            metadata_gateway,
            accept_invalid_certs,
            llama_server: PathBuf::from(llama_server),
            api_server: env::var_os("API_SERVER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("local-ai-api")),
            record_file: env::var_os("RUNNING_SERVICE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("running_service.json")),
            lock_file: env::var_os("START_LOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("local_ai_start.lock")),
            output_dir,
            work_dir: env::var_os("MODEL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            resource_dir: env::var_os("RESOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("resources")),
            log_dir: PathBuf::from("logs"),
        })
    }

    /// URL of the manifest (or blob) for `cid` on the content gateway.
    #[must_use]
    pub fn manifest_url(&self, cid: &str) -> String {
        format!("{}{cid}", self.manifest_gateway)
    }

    /// URL of the family metadata document for `cid`.
    #[must_use]
    pub fn metadata_url(&self, cid: &str) -> String {
        format!("{}{cid}", self.metadata_gateway)
    }

    /// Installed artifact path for a model hash: `<output_dir>/<hash>.gguf`.
    #[must_use]
    pub fn model_path(&self, hash: &str) -> PathBuf {
        self.output_dir.join(format!("{hash}.gguf"))
    }
}

fn gateway_from_env(var: &'static str, default: &str) -> Result<String, SettingsError> {
    let raw = match env::var(var) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    };
    if Url::parse(&raw).is_err() {
        return Err(SettingsError::InvalidGateway { var, url: raw });
    }
    Ok(if raw.ends_with('/') { raw } else { format!("{raw}/") })
}

fn parse_bool(raw: &str) -> bool {
    !matches!(raw.trim(), "0" | "false" | "no" | "off")
}
