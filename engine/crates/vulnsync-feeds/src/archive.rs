//! Local artifact handling: decompression, extraction and cleanup

use async_compression::tokio::bufread::GzipDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use vulnsync_core::{Error, Result};
use walkdir::WalkDir;

/// Decompress a gzip file; returns the decompressed size
pub async fn gunzip(source: &Path, dest: &Path) -> Result<u64> {
    let input = tokio::fs::File::open(source).await?;
    let mut decoder = GzipDecoder::new(BufReader::new(input));
    let mut output = tokio::fs::File::create(dest).await?;

    let written = tokio::io::copy(&mut decoder, &mut output)
        .await
        .map_err(|e| Error::Parse(format!("Failed to decompress {}: {}", source.display(), e)))?;
    output.flush().await?;

    debug!(source = %source.display(), bytes = written, "Decompressed");
    Ok(written)
}

/// Extract a zip archive into `dest`
pub async fn unzip(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| Error::Parse(format!("Invalid archive {}: {}", archive.display(), e)))?;
        zip.extract(&dest)
            .map_err(|e| Error::Parse(format!("Failed to extract {}: {}", archive.display(), e)))?;
        debug!(archive = %archive.display(), entries = zip.len(), "Extracted");
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("extract task failed: {}", e)))?
}

/// All `*.json` files below `dir`, sorted by path
pub fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// Remove a working directory, logging instead of failing
pub async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "Failed to remove working directory: {}", e),
    }
}

/// Remove files, ignoring ones already gone
pub async fn remove_files(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "Failed to remove file: {}", e);
            }
        }
    }
}
