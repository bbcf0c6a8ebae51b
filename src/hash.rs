//! Content hashing of local files.
//!
//! Computes SHA-256 digests in bounded memory. The digest runs on the
//! blocking pool so large model blobs never stall the async scheduler.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const BUF_SIZE: usize = 64 * 1024;

/// SHA-256 of an in-memory buffer as lowercase hex.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-256 of a file and return the digest as lowercase hex.
///
/// Reads in chunks to keep memory use bounded; suitable for multi-gigabyte
/// blobs.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be opened or read.
pub fn sha256_file_sync(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Async wrapper around [`sha256_file_sync`] running on the blocking pool.
///
/// # Errors
///
/// Returns the underlying I/O error, or an error of kind `Other` if the
/// blocking task is cancelled.
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file_sync(&path))
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
}
