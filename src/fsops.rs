//! Async filesystem leaf operations: archive extraction, move, recursive
//! delete.
//!
//! Each operation runs on the blocking pool so the fetch orchestrator's
//! cooperative scheduler never blocks on disk-heavy work.

use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::ZipArchive;

/// Extracts any `.zip` blobs among `paths` into their parent directory and
/// removes the archive afterwards. Non-archive paths are left untouched.
///
/// # Errors
///
/// Returns the first extraction or I/O error encountered.
pub async fn extract_archives(paths: &[PathBuf]) -> io::Result<()> {
    for path in paths {
        if path.extension().is_some_and(|ext| ext == "zip") {
            let archive = path.clone();
            tokio::task::spawn_blocking(move || extract_zip_sync(&archive))
                .await
                .map_err(|e| io::Error::other(e.to_string()))??;
        }
    }
    Ok(())
}

/// Moves `from` to `to`, replacing any existing destination.
///
/// Tries a rename first; on cross-device failure falls back to a copy and
/// delete of the source.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || move_path_sync(&from, &to))
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
}

/// Recursively deletes `path`. A missing path is not an error.
///
/// # Errors
///
/// Returns the underlying I/O error for anything other than a missing path.
pub async fn remove_tree(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || match fs::remove_dir_all(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .await
    .map_err(|e| io::Error::other(e.to_string()))?
}

fn extract_zip_sync(archive_path: &Path) -> io::Result<()> {
    let dest = archive_path
        .parent()
        .ok_or_else(|| io::Error::other("archive has no parent directory"))?
        .to_path_buf();

    let file = fs::File::open(archive_path)?;
    extract_zip_into(file, &dest)?;

    debug!(archive = %archive_path.display(), "archive extracted, removing");
    fs::remove_file(archive_path)?;
    Ok(())
}

fn extract_zip_into<R: Read + Seek>(reader: R, dest: &Path) -> io::Result<()> {
    let mut archive = ZipArchive::new(reader).map_err(io::Error::other)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(io::Error::other)?;
        // enclosed_name rejects entries that would escape the destination.
        let Some(rel) = entry.enclosed_name() else {
            warn!(index, "skipping archive entry with unsafe path");
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn move_path_sync(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        if to.is_dir() {
            fs::remove_dir_all(to)?;
        } else {
            fs::remove_file(to)?;
        }
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "rename failed, copying"
            );
            copy_recursive(from, to)?;
            if from.is_dir() {
                fs::remove_dir_all(from)
            } else {
                fs::remove_file(from)
            }
        }
    }
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}
