//! # DiffEngine
//!
//! Compares two manifests' file lists and produces an added/modified/deleted
//! summary with bounded change-detail buckets, per `spec.md` §4.6. Ported
//! from the teacher's `restore::diff_snapshots`, generalized from a flat
//! `Vec<String>` per bucket to the bounded, size-carrying `ChangeDetail`
//! buckets the version model stores.

use crate::manifest::FileEntry;
use crate::version::{ChangeBucket, ChangeDetail, VersionDiff};
use std::collections::HashMap;

/// Computes the diff of `current` against `previous` (absent for a
/// project's first version). `detail_limit` bounds each change bucket to at
/// most that many entries (`spec.md`'s `max_change_detail_entries`, N≈50).
pub fn diff(current: &[FileEntry], previous: Option<&[FileEntry]>, detail_limit: usize) -> VersionDiff {
    let previous = match previous {
        None => {
            let added: Vec<ChangeDetail> = current
                .iter()
                .map(|e| ChangeDetail {
                    path: e.path.clone(),
                    hash: e.hash.clone(),
                    size: e.size,
                })
                .collect();
            let size_change: i64 = current.iter().map(|e| e.size as i64).sum();
            return VersionDiff {
                files_added: current.len() as u64,
                files_modified: 0,
                files_deleted: 0,
                size_change,
                added: ChangeBucket::from_all(added, detail_limit),
                modified: ChangeBucket::default(),
                deleted: ChangeBucket::default(),
            };
        }
        Some(p) => p,
    };

    let prev_by_path: HashMap<&str, &FileEntry> =
        previous.iter().map(|e| (e.path.as_str(), e)).collect();
    let curr_by_path: HashMap<&str, &FileEntry> =
        current.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut size_change: i64 = 0;

    for entry in current {
        match prev_by_path.get(entry.path.as_str()) {
            None => {
                added.push(ChangeDetail {
                    path: entry.path.clone(),
                    hash: entry.hash.clone(),
                    size: entry.size,
                });
                size_change += entry.size as i64;
            }
            Some(prev_entry) => {
                if prev_entry.hash != entry.hash {
                    modified.push(ChangeDetail {
                        path: entry.path.clone(),
                        hash: entry.hash.clone(),
                        size: entry.size,
                    });
                    size_change += entry.size as i64 - prev_entry.size as i64;
                }
            }
        }
    }

    let mut deleted = Vec::new();
    for entry in previous {
        if !curr_by_path.contains_key(entry.path.as_str()) {
            deleted.push(ChangeDetail {
                path: entry.path.clone(),
                hash: entry.hash.clone(),
                size: entry.size,
            });
            size_change -= entry.size as i64;
        }
    }

    VersionDiff {
        files_added: added.len() as u64,
        files_modified: modified.len() as u64,
        files_deleted: deleted.len() as u64,
        size_change,
        added: ChangeBucket::from_all(added, detail_limit),
        modified: ChangeBucket::from_all(modified, detail_limit),
        deleted: ChangeBucket::from_all(deleted, detail_limit),
    }
}
