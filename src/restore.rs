//! # Restorer
//!
//! Materializes a version to a directory: either by extracting its
//! snapshot archive, or by replaying its manifest against the blob store
//! and inline content (`spec.md` §4.9). Ported from the teacher's
//! `restore_snapshot` (reader → decrypt → decompress → write, per file),
//! generalized here to two source shapes instead of one, and with per-file
//! errors collected rather than aborting the whole restore.

use crate::blob_store::BlobStore;
use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::manifest::{ManifestCodec, Storage};
use crate::{archive, hasher};
use base64::Engine as _;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// One per-file failure collected during a restore, rather than aborting
/// the whole job (`spec.md` §4.9, §7: "per-file errors ... job fails only
/// if no file could be processed").
#[derive(Debug, Clone)]
pub struct RestoreFileError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreStats {
    pub files_restored: u64,
    pub total_size: u64,
    pub errors: Vec<RestoreFileError>,
}

impl RestoreStats {
    pub fn success(&self) -> bool {
        self.errors.is_empty() || self.files_restored > 0
    }
}

pub struct Restorer {
    file_store: Arc<dyn FileStore>,
    blob_store: Arc<BlobStore>,
}

impl Restorer {
    pub fn new(file_store: Arc<dyn FileStore>, blob_store: Arc<BlobStore>) -> Self {
        Self {
            file_store,
            blob_store,
        }
    }

    /// The underlying store, for callers (`Engine::list_files`,
    /// `Engine::fetch_artifact`) that need to read an object this restorer
    /// doesn't have a dedicated method for.
    pub fn file_store(&self) -> &dyn FileStore {
        &*self.file_store
    }

    /// Restores a snapshot-backed version by extracting its archive into
    /// `target_dir`.
    pub fn restore_snapshot(&self, snapshot_ref: &str, target_dir: &Path) -> Result<RestoreStats> {
        fs::create_dir_all(target_dir)?;
        let tmp_zip = target_dir.with_extension(format!("tmp-snapshot-{}.zip", std::process::id()));
        self.file_store.export_to_path(snapshot_ref, &tmp_zip)?;
        let (count, size) = archive::unzip_to_directory(&tmp_zip, target_dir)?;
        fs::remove_file(&tmp_zip).ok();
        Ok(RestoreStats {
            files_restored: count,
            total_size: size,
            errors: Vec::new(),
        })
    }

    /// Restores a manifest-backed (CAS) version by reading `manifest_ref`
    /// and replaying each entry into `target_dir`. A missing blob or
    /// decode failure for one entry is recorded in `Stats.errors` and does
    /// not stop the rest of the restore.
    pub fn restore_manifest(&self, manifest_ref: &str, target_dir: &Path) -> Result<RestoreStats> {
        fs::create_dir_all(target_dir)?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut self.file_store.open(manifest_ref)?, &mut buf)?;
        let manifest = ManifestCodec::decode(&buf)?;

        let mut stats = RestoreStats::default();
        for entry in &manifest.files {
            let dest = target_dir.join(&entry.path);
            let result = match entry.storage {
                Storage::Cas => self.restore_cas_entry(&dest, entry),
                Storage::Inline => self.restore_inline_entry(&dest, entry),
            };
            match result {
                Ok(()) => {
                    stats.files_restored += 1;
                    stats.total_size += entry.size;
                }
                Err(e) => stats.errors.push(RestoreFileError {
                    path: entry.path.clone(),
                    message: e.to_string(),
                }),
            }
        }
        Ok(stats)
    }

    fn restore_cas_entry(&self, dest: &Path, entry: &crate::manifest::FileEntry) -> Result<()> {
        let blob_id = entry
            .blob_id
            .as_ref()
            .ok_or_else(|| EngineError::ManifestCorrupt(format!("cas entry {} missing blob_id", entry.path)))?;
        let mut reader = self
            .blob_store
            .open(blob_id)
            .map_err(|_| EngineError::BlobMissing {
                hash: blob_id.clone(),
            })?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(dest)?;
        std::io::copy(&mut reader, &mut out)?;
        Ok(())
    }

    fn restore_inline_entry(&self, dest: &Path, entry: &crate::manifest::FileEntry) -> Result<()> {
        let content = entry
            .content
            .as_ref()
            .ok_or_else(|| EngineError::ManifestCorrupt(format!("inline entry {} missing content", entry.path)))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| EngineError::ManifestCorrupt(format!("inline entry {}: {e}", entry.path)))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(dest)?;
        out.write_all(&bytes)?;
        Ok(())
    }

    /// Re-hashes every file under `dir` into a canonical manifest, used by
    /// tests to assert `restore(V, dir)` then re-hash yields `V.hash`
    /// (`spec.md` §8 round-trip property).
    pub fn rehash_directory(&self, dir: &Path) -> Result<Vec<crate::manifest::FileEntry>> {
        let mut entries = Vec::new();
        for e in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = e
                .path()
                .strip_prefix(dir)
                .unwrap_or(e.path())
                .to_string_lossy()
                .replace('\\', "/");
            let hash = hasher::hash_file(e.path())?;
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(crate::manifest::FileEntry::inline(relative, hash, size, String::new()));
        }
        Ok(entries)
    }
}
