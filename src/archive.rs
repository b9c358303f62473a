//! # Archive helpers
//!
//! Directory-to-zip and zip-to-directory conversion shared by `PushEngine`
//! (building a snapshot archive for the Nth version) and `DownloadEngine`
//! (assembling a download artifact from either a snapshot copy or a
//! restored directory). In the original Python service this logic was
//! duplicated across two Celery task modules (`versioning/tasks.py` and
//! `versioning/download_tasks.py`); here it lives once.

use crate::error::{EngineError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Zips every regular file under `source_dir` into `dest_zip`, using paths
/// relative to `source_dir` (forward-slash normalized) as archive entry
/// names. Returns the number of files written and their total uncompressed
/// size.
pub fn zip_directory(source_dir: &Path, dest_zip: &Path) -> Result<(u64, u64)> {
    if let Some(parent) = dest_zip.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest_zip)?;
    let mut writer = ZipWriter::new(file);
    let options =
        FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut count = 0u64;
    let mut total_size = 0u64;

    for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(source_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        writer
            .start_file(&relative, options)
            .map_err(|e| EngineError::internal(format!("zip entry {relative}: {e}")))?;
        writer.write_all(&data)?;

        count += 1;
        total_size += data.len() as u64;
    }

    writer
        .finish()
        .map_err(|e| EngineError::internal(format!("finalizing zip: {e}")))?;

    Ok((count, total_size))
}

/// Extracts every entry of `source_zip` into `dest_dir`, creating parent
/// directories as needed. Returns the number of files extracted and their
/// total uncompressed size.
pub fn unzip_to_directory(source_zip: &Path, dest_dir: &Path) -> Result<(u64, u64)> {
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(source_zip)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| EngineError::internal(format!("reading zip {}: {e}", source_zip.display())))?;

    let mut count = 0u64;
    let mut total_size = 0u64;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EngineError::internal(format!("zip entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let dest_path = dest_dir.join(&name);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest_path)?;
        let size = std::io::copy(&mut entry, &mut out)?;
        count += 1;
        total_size += size;
    }

    Ok((count, total_size))
}
