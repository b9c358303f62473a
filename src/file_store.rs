//! # FileStore
//!
//! Opaque byte-range storage under stable string keys. Every other
//! component — the blob store, the manifest codec's callers, the restorer,
//! the download engine — goes through this trait rather than touching
//! `std::fs` directly, so a production deployment can swap in an object
//! store without the engine noticing.
//!
//! `LocalFileStore` is the filesystem-backed implementation used by the CLI
//! and the test suite. Keys are namespaced under a root directory and may
//! contain `/`; writes are atomic (temp file + rename) so a crash mid-write
//! never leaves a partial object visible under its final key.

use crate::error::{EngineError, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Capability set every storage backend must provide. Implementations must
/// make each operation atomic with respect to full success — a caller never
/// observes a partially-written object.
pub trait FileStore: Send + Sync {
    /// Writes `data` under `key`, returning the number of bytes written.
    fn put(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Opens `key` for reading. Fails with `StorageUnavailable` if absent.
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Removes `key`. A no-op (not an error) if the key does not exist.
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns whether `key` currently has a stored payload.
    fn exists(&self, key: &str) -> bool;

    /// Returns the byte size of the stored payload at `key`.
    fn stat(&self, key: &str) -> Result<u64>;

    /// Copies the object at `key` to a plain filesystem path, for callers
    /// (like `Restorer`) that need a real file handle (e.g. to hand to the
    /// `zip` crate). Default implementation streams through `open`.
    fn export_to_path(&self, key: &str, dest: &Path) -> Result<()> {
        let mut reader = self.open(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("tmp-export");
        {
            let mut out = File::create(&tmp)?;
            std::io::copy(&mut reader, &mut out)?;
        }
        fs::rename(&tmp, dest)?;
        Ok(())
    }

    /// Imports a plain filesystem path into the store under `key`, for
    /// callers that built a file on disk first (e.g. a freshly zipped
    /// snapshot) rather than holding the bytes in memory.
    fn import_from_path(&self, key: &str, src: &Path) -> Result<u64> {
        let mut reader = File::open(src)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        self.put(key, &buf)
    }

    /// Lists keys stored under `prefix`, for backends that expose
    /// directory-like structure (used by `BlobStore::sweep` to enumerate
    /// CAS shards). Backends that cannot cheaply enumerate their keyspace
    /// may return an empty list; the sweep then has nothing to reconcile
    /// against.
    fn list_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A `FileStore` rooted at a directory on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl FileStore for LocalFileStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::StorageUnavailable(format!(
                    "creating parent dir for {key}: {e}"
                ))
            })?;
        }
        // Write to a sibling temp file, then rename — rename is atomic on
        // the same filesystem, so a crash mid-write never exposes a
        // truncated object under `key`.
        let tmp = path.with_extension(format!(
            "tmp-{}",
            std::process::id()
        ));
        {
            let mut f = File::create(&tmp).map_err(|e| {
                EngineError::StorageUnavailable(format!("creating {key}: {e}"))
            })?;
            f.write_all(data).map_err(|e| {
                EngineError::StorageUnavailable(format!("writing {key}: {e}"))
            })?;
            f.sync_all().ok();
        }
        fs::rename(&tmp, &path)
            .map_err(|e| EngineError::StorageUnavailable(format!("finalizing {key}: {e}")))?;
        Ok(data.len() as u64)
    }

    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key);
        let f = File::open(&path)
            .map_err(|_| EngineError::StorageUnavailable(format!("no such object: {key}")))?;
        Ok(Box::new(BufReader::new(f)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::StorageUnavailable(format!(
                "deleting {key}: {e}"
            ))),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve(key).exists()
    }

    fn stat(&self, key: &str) -> Result<u64> {
        let path = self.resolve(key);
        let meta = fs::metadata(&path)
            .map_err(|_| EngineError::StorageUnavailable(format!("no such object: {key}")))?;
        Ok(meta.len())
    }

    fn export_to_path(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.resolve(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, dest)
            .map_err(|e| EngineError::StorageUnavailable(format!("exporting {key}: {e}")))?;
        Ok(())
    }

    fn import_from_path(&self, key: &str, src: &Path) -> Result<u64> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        fs::copy(src, &tmp)
            .map_err(|e| EngineError::StorageUnavailable(format!("importing into {key}: {e}")))?;
        let size = fs::metadata(&tmp)?.len();
        fs::rename(&tmp, &path)
            .map_err(|e| EngineError::StorageUnavailable(format!("finalizing {key}: {e}")))?;
        Ok(size)
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.resolve(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            keys.push(relative);
        }
        Ok(keys)
    }
}
