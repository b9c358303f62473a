//! # MasterTree
//!
//! A project's per-directory working tree on disk, reconciled against an
//! incoming file list on every push: copy-new, skip-unchanged, delete-absent,
//! per `spec.md` §4.4. Ported from the shape of the teacher's `backup_target`
//! walk (`backup.rs`, now removed from this tree — see `DESIGN.md`), but
//! generalized from "walk source, write manifest" to "reconcile destination
//! against an authoritative list, then prune."
//!
//! The tree is never exposed as a public surface; `PushEngine` is the only
//! caller, and holds it only for the duration of one push under the
//! project's mutex (`spec.md` §5).

use crate::error::{EngineError, Result};
use crate::hasher;
use crate::manifest::normalize_path;
use crate::version::PushFileEntry;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Per-pass counts returned by `reconcile`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub copied: u64,
    pub unchanged: u64,
    pub removed: u64,
}

/// How often `reconcile` calls the caller-supplied cancellation check, in
/// files processed. `spec.md` §4.4 requires at most every 10 files.
const CANCEL_CHECK_CADENCE: usize = 10;

pub struct MasterTree {
    root: PathBuf,
}

impl MasterTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Brings the tree into exact agreement with `file_list`: copies new or
    /// changed content in via `fetch`, leaves already-matching files alone,
    /// then deletes anything on disk that isn't named in `file_list` and
    /// prunes directories left empty by that deletion.
    ///
    /// `fetch(entry)` resolves the raw bytes for one entry; `cancel_check()`
    /// is polled at least every `CANCEL_CHECK_CADENCE` files and, if it
    /// returns `true`, aborts with `EngineError::Cancelled` after the
    /// already-atomic writes so far (no partial file is ever visible, only
    /// a possibly-incomplete set of them).
    pub fn reconcile<F, C>(
        &self,
        file_list: &[PushFileEntry],
        mut fetch: F,
        mut cancel_check: C,
    ) -> Result<ReconcileSummary>
    where
        F: FnMut(&PushFileEntry) -> Result<Box<dyn Read>>,
        C: FnMut() -> bool,
    {
        fs::create_dir_all(&self.root)?;

        let mut summary = ReconcileSummary::default();
        let mut expected: Vec<String> = Vec::with_capacity(file_list.len());

        for (i, entry) in file_list.iter().enumerate() {
            if i % CANCEL_CHECK_CADENCE == 0 && cancel_check() {
                return Err(EngineError::Cancelled);
            }

            let relative = normalize_path(&entry.relative_path);
            expected.push(relative.clone());
            let dest = self.root.join(&relative);

            if dest.is_file() && file_matches_hash(&dest, &entry.hash)? {
                summary.unchanged += 1;
                continue;
            }

            let mut reader = fetch(entry)?;
            write_atomic(&dest, &mut reader)?;
            summary.copied += 1;
        }

        if cancel_check() {
            return Err(EngineError::Cancelled);
        }

        summary.removed = self.remove_unlisted(&expected)?;
        self.prune_empty_dirs(&self.root.clone())?;

        Ok(summary)
    }

    /// Deletes every regular file under the root whose path (relative,
    /// forward-slash normalized) is not in `expected`. Returns the count
    /// removed.
    fn remove_unlisted(&self, expected: &[String]) -> Result<u64> {
        use std::collections::HashSet;
        let keep: HashSet<&str> = expected.iter().map(|s| s.as_str()).collect();

        let mut removed = 0u64;
        for entry in walkdir::WalkDir::new(&self.root)
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
            if !keep.contains(relative.as_str()) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes empty directories bottom-up, never deleting the root itself.
    fn prune_empty_dirs(&self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                self.prune_empty_dirs(&entry.path())?;
            }
        }
        if dir != self.root && fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }
}

fn file_matches_hash(path: &Path, expected_hash: &str) -> Result<bool> {
    let actual = hasher::hash_file(path)?;
    Ok(actual == expected_hash)
}

/// Writes `reader`'s content to `dest` via temp-file-then-rename, so a
/// caller never observes a partially-written file at `dest`.
fn write_atomic(dest: &Path, reader: &mut dyn Read) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(format!("tmp-{}", std::process::id()));
    {
        let mut f = File::create(&tmp)?;
        std::io::copy(reader, &mut f)?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, dest)?;
    Ok(())
}
