//! Manifest schema and retrieval.
//!
//! The top-level content address resolves to a JSON manifest describing the
//! sibling blobs that make up one model package.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::{MANIFEST_CONNECT_TIMEOUT, MANIFEST_TOTAL_TIMEOUT};
use super::error::FetchError;
use crate::config::Settings;

/// One downloadable blob inside a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Content address of the blob on the gateway.
    pub cid: String,
    /// Hex content hash the fetched bytes must reproduce.
    pub file_hash: String,
    /// File name inside the working directory.
    pub file_name: String,
}

/// Manifest fetched for a top-level model hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Working directory name for package assembly.
    pub folder_name: String,
    /// Expected blob count.
    pub num_of_files: usize,
    /// Blobs to download, in manifest order.
    pub files: Vec<BlobDescriptor>,
    /// Model family tag influencing command construction.
    #[serde(default)]
    pub family: Option<String>,
    /// Advisory memory hint in GiB.
    #[serde(default)]
    pub ram: Option<f64>,
    /// The top-level hash this manifest was resolved from; injected after
    /// the fetch, never present in the gateway document.
    #[serde(default)]
    pub filecoin_hash: String,
}

/// Fetches and parses the manifest for `hash`.
///
/// # Errors
///
/// Returns [`FetchError::Manifest`] on a non-200 status and
/// [`FetchError::ManifestTransport`] on transport or parse failures.
pub async fn fetch_manifest(settings: &Settings, hash: &str) -> Result<Manifest, FetchError> {
    let url = settings.manifest_url(hash);
    let client = reqwest::Client::builder()
        .timeout(MANIFEST_TOTAL_TIMEOUT)
        .connect_timeout(MANIFEST_CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(settings.accept_invalid_certs)
        .build()
        .map_err(|e| FetchError::manifest_transport(&url, e))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| FetchError::manifest_transport(&url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::manifest(&url, status.as_u16()));
    }

    let mut manifest: Manifest = response
        .json()
        .await
        .map_err(|e| FetchError::manifest_transport(&url, e))?;
    manifest.filecoin_hash = hash.to_string();

    debug!(
        hash,
        folder = %manifest.folder_name,
        files = manifest.num_of_files,
        "manifest resolved"
    );
    Ok(manifest)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_deserializes_without_optional_fields() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "folder_name": "m1",
                "num_of_files": 1,
                "files": [{"cid": "QmB", "file_hash": "h1", "file_name": "m1"}]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.folder_name, "m1");
        assert_eq!(manifest.files.len(), 1);
        assert!(manifest.family.is_none());
        assert!(manifest.ram.is_none());
        assert!(manifest.filecoin_hash.is_empty());
    }

    #[test]
    fn test_manifest_keeps_blob_order() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "folder_name": "m1",
                "num_of_files": 2,
                "files": [
                    {"cid": "Qm1", "file_hash": "h1", "file_name": "a"},
                    {"cid": "Qm2", "file_hash": "h2", "file_name": "b"}
                ],
                "family": "qwen3",
                "ram": 20.5
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.files[0].cid, "Qm1");
        assert_eq!(manifest.files[1].cid, "Qm2");
        assert_eq!(manifest.family.as_deref(), Some("qwen3"));
    }
}
