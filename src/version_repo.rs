//! # VersionRepository
//!
//! Persistence and lookup of `Version` records: creation, dedupe lookup by
//! `(project, hash)`, the completion transaction that assigns
//! `version_number` and parent linkage, and deletion (`spec.md` §4.5).
//!
//! Like `BlobStore`, there is no SQL database in this stack: the index is
//! one JSON document through `FileStore`, cached behind a `parking_lot`
//! mutex and written through on every mutation. `version_number` assignment
//! happens while this mutex is held, which is what makes `complete` atomic
//! with respect to concurrent completions — the per-project mutex the
//! caller (`PushEngine`) also holds during a push is the outer guarantee
//! that only one push per project is ever completing at a time (`spec.md`
//! §5); this inner lock is the backstop the uniqueness invariant relies on.

use crate::blob_store::BlobStore;
use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::ids::Uid;
use crate::version::{Version, VersionDiff, VersionStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

const INDEX_KEY: &str = "versions/_index.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct VersionIndex {
    versions: Vec<Version>,
}

pub struct VersionRepository {
    file_store: Arc<dyn FileStore>,
    blob_store: Arc<BlobStore>,
    index: Mutex<VersionIndex>,
}

impl VersionRepository {
    pub fn new(file_store: Arc<dyn FileStore>, blob_store: Arc<BlobStore>) -> Result<Self> {
        let index = if file_store.exists(INDEX_KEY) {
            let mut buf = Vec::new();
            file_store.open(INDEX_KEY)?.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf)
                .map_err(|e| EngineError::internal(format!("loading version index: {e}")))?
        } else {
            VersionIndex::default()
        };
        Ok(Self {
            file_store,
            blob_store,
            index: Mutex::new(index),
        })
    }

    fn persist(&self, index: &VersionIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)
            .map_err(|e| EngineError::internal(format!("serializing version index: {e}")))?;
        self.file_store.put(INDEX_KEY, &bytes)?;
        Ok(())
    }

    pub fn create_pending(
        &self,
        project: &str,
        created_by: &str,
        commit_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Version> {
        let version = Version::new_pending(project, created_by, commit_message, now);
        let mut index = self.index.lock();
        index.versions.push(version.clone());
        self.persist(&index)?;
        Ok(version)
    }

    pub fn get(&self, uid: &Uid) -> Result<Version> {
        let index = self.index.lock();
        index
            .versions
            .iter()
            .find(|v| &v.uid == uid)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("version {uid}")))
    }

    /// O(1)-ish dedupe lookup: the most recent completed version in
    /// `project` whose `hash` equals `manifest_hash`.
    pub fn find_completed_by_hash(&self, project: &str, manifest_hash: &str) -> Option<Version> {
        let index = self.index.lock();
        index
            .versions
            .iter()
            .filter(|v| {
                v.project == project
                    && v.status == VersionStatus::Completed
                    && v.hash.as_deref() == Some(manifest_hash)
            })
            .max_by_key(|v| v.version_number.unwrap_or(0))
            .cloned()
    }

    /// The most recent completed version in `project`, used as the parent
    /// for diffing (`spec.md` §4.7 step 9). Excludes `exclude` (the
    /// placeholder being completed).
    pub fn latest_completed(&self, project: &str, exclude: &Uid) -> Option<Version> {
        let index = self.index.lock();
        index
            .versions
            .iter()
            .filter(|v| v.project == project && v.status == VersionStatus::Completed && &v.uid != exclude)
            .max_by_key(|v| v.version_number.unwrap_or(0))
            .cloned()
    }

    pub fn count_completed(&self, project: &str) -> u64 {
        let index = self.index.lock();
        index
            .versions
            .iter()
            .filter(|v| v.project == project && v.status == VersionStatus::Completed)
            .count() as u64
    }

    pub fn set_processing(&self, uid: &Uid) -> Result<()> {
        let mut index = self.index.lock();
        let v = find_mut(&mut index, uid)?;
        v.status = VersionStatus::Processing;
        self.persist(&index)
    }

    /// Transitions `processing -> completed`, assigning `version_number =
    /// 1 + count(completed in project)` and recording parent linkage and
    /// diff, all while holding the index mutex — the atomic step `spec.md`
    /// §4.5 describes.
    #[allow(clippy::too_many_arguments)]
    pub fn complete(
        &self,
        uid: &Uid,
        manifest_ref: Option<String>,
        snapshot_ref: Option<String>,
        is_snapshot: bool,
        file_count: u64,
        file_size: u64,
        hash: String,
        previous_version: Option<Uid>,
        diff: VersionDiff,
        now: DateTime<Utc>,
    ) -> Result<Version> {
        let mut index = self.index.lock();
        let project = find_mut(&mut index, uid)?.project.clone();
        let number = 1 + index
            .versions
            .iter()
            .filter(|v| v.project == project && v.status == VersionStatus::Completed)
            .count() as u64;

        let v = find_mut(&mut index, uid)?;
        v.status = VersionStatus::Completed;
        v.version_number = Some(number);
        v.is_snapshot = is_snapshot;
        v.manifest_ref = manifest_ref;
        v.snapshot_ref = snapshot_ref;
        v.hash = Some(hash);
        v.file_count = file_count;
        v.file_size = file_size;
        v.previous_version = previous_version;
        v.diff = diff;
        v.completed_at = Some(now);
        let completed = v.clone();
        self.persist(&index)?;
        Ok(completed)
    }

    pub fn fail(&self, uid: &Uid, reason: impl Into<String>) -> Result<()> {
        let mut index = self.index.lock();
        let v = find_mut(&mut index, uid)?;
        v.status = VersionStatus::Failed;
        v.failure_reason = Some(reason.into());
        self.persist(&index)
    }

    /// Deletes the version row and everything it owned: every CAS
    /// `BlobReference` it held (releasing the underlying blob payload once
    /// its count reaches zero, `spec.md` §3) and its `manifest.json` or
    /// `snapshot.zip` artifact.
    pub fn delete(&self, uid: &Uid) -> Result<()> {
        let removed = {
            let mut index = self.index.lock();
            let position = index
                .versions
                .iter()
                .position(|v| &v.uid == uid)
                .ok_or_else(|| EngineError::not_found(format!("version {uid}")))?;
            let removed = index.versions.remove(position);
            self.persist(&index)?;
            removed
        };

        self.blob_store.release_version(uid)?;
        if let Some(manifest_ref) = &removed.manifest_ref {
            self.file_store.delete(manifest_ref)?;
        }
        if let Some(snapshot_ref) = &removed.snapshot_ref {
            self.file_store.delete(snapshot_ref)?;
        }
        Ok(())
    }

    /// Completed versions in `project`, newest first.
    pub fn list_completed(&self, project: &str) -> Vec<Version> {
        let index = self.index.lock();
        let mut versions: Vec<Version> = index
            .versions
            .iter()
            .filter(|v| v.project == project && v.status == VersionStatus::Completed)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        versions
    }

    /// All versions (any status) in `project`, for callers that also want
    /// to see in-flight processing versions (`ListVersions` with
    /// `include_processing`).
    pub fn list_all(&self, project: &str) -> Vec<Version> {
        let index = self.index.lock();
        index
            .versions
            .iter()
            .filter(|v| v.project == project)
            .cloned()
            .collect()
    }
}

fn find_mut<'a>(index: &'a mut VersionIndex, uid: &Uid) -> Result<&'a mut Version> {
    index
        .versions
        .iter_mut()
        .find(|v| &v.uid == uid)
        .ok_or_else(|| EngineError::not_found(format!("version {uid}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::LocalFileStore;

    fn repo() -> VersionRepository {
        let dir = std::env::temp_dir().join(format!(
            "but-next-vcs-versionrepo-{}-{}",
            std::process::id(),
            crate::hasher::hash_bytes(format!("{:?}", std::time::Instant::now()).as_bytes())
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let fs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir));
        let blobs = Arc::new(BlobStore::new(Arc::clone(&fs)).unwrap());
        VersionRepository::new(fs, blobs).unwrap()
    }

    #[test]
    fn numbering_is_sequential_per_project() {
        let repo = repo();
        let now = Utc::now();
        let v1 = repo.create_pending("p1", "alice", "first", now).unwrap();
        repo.set_processing(&v1.uid).unwrap();
        let c1 = repo
            .complete(&v1.uid, Some("m1".into()), None, false, 1, 10, "h1".into(), None, VersionDiff::default(), now)
            .unwrap();
        assert_eq!(c1.version_number, Some(1));

        let v2 = repo.create_pending("p1", "alice", "second", now).unwrap();
        repo.set_processing(&v2.uid).unwrap();
        let c2 = repo
            .complete(&v2.uid, Some("m2".into()), None, false, 1, 10, "h2".into(), Some(v1.uid.clone()), VersionDiff::default(), now)
            .unwrap();
        assert_eq!(c2.version_number, Some(2));
    }

    #[test]
    fn deletion_does_not_renumber_survivors() {
        let repo = repo();
        let now = Utc::now();
        let v1 = repo.create_pending("p1", "a", "m1", now).unwrap();
        repo.complete(&v1.uid, Some("m".into()), None, false, 0, 0, "h1".into(), None, VersionDiff::default(), now).unwrap();
        let v2 = repo.create_pending("p1", "a", "m2", now).unwrap();
        repo.complete(&v2.uid, Some("m".into()), None, false, 0, 0, "h2".into(), Some(v1.uid.clone()), VersionDiff::default(), now).unwrap();

        repo.delete(&v1.uid).unwrap();
        let v2_after = repo.get(&v2.uid).unwrap();
        assert_eq!(v2_after.version_number, Some(2));

        let v3 = repo.create_pending("p1", "a", "m3", now).unwrap();
        let c3 = repo.complete(&v3.uid, Some("m".into()), None, false, 0, 0, "h3".into(), Some(v2.uid.clone()), VersionDiff::default(), now).unwrap();
        assert_eq!(c3.version_number, Some(3));
    }

    #[test]
    fn deleting_a_version_releases_its_blob_references() {
        let dir = std::env::temp_dir().join(format!(
            "but-next-vcs-versionrepo-blobs-{}-{}",
            std::process::id(),
            crate::hasher::hash_bytes(format!("{:?}", std::time::Instant::now()).as_bytes())
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let fs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir));
        let blobs = Arc::new(BlobStore::new(Arc::clone(&fs)).unwrap());
        let repo = VersionRepository::new(Arc::clone(&fs), Arc::clone(&blobs)).unwrap();

        let now = Utc::now();
        let v1 = repo.create_pending("p1", "a", "m1", now).unwrap();
        let (hash, _, _) = blobs.store(&b"big content"[..], None).unwrap();
        blobs.acquire(&hash, &v1.uid, "p1").unwrap();
        repo.complete(&v1.uid, Some("m".into()), None, false, 1, 11, "h1".into(), None, VersionDiff::default(), now)
            .unwrap();

        assert_eq!(blobs.ref_count(&hash), 1);
        assert!(blobs.exists(&hash));

        repo.delete(&v1.uid).unwrap();
        assert_eq!(blobs.ref_count(&hash), 0);
        assert!(!blobs.exists(&hash), "payload is deleted once its last reference is gone");
    }

    #[test]
    fn dedupe_lookup_finds_matching_hash() {
        let repo = repo();
        let now = Utc::now();
        let v1 = repo.create_pending("p1", "a", "m1", now).unwrap();
        repo.complete(&v1.uid, Some("m".into()), None, false, 1, 10, "samehash".into(), None, VersionDiff::default(), now).unwrap();

        let found = repo.find_completed_by_hash("p1", "samehash").unwrap();
        assert_eq!(found.uid, v1.uid);
        assert!(repo.find_completed_by_hash("p1", "otherhash").is_none());
        assert!(repo.find_completed_by_hash("p2", "samehash").is_none());
    }

    #[test]
    fn list_completed_orders_newest_first() {
        let repo = repo();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(10);
        let v1 = repo.create_pending("p1", "a", "m1", t1).unwrap();
        repo.complete(&v1.uid, Some("m".into()), None, false, 0, 0, "h1".into(), None, VersionDiff::default(), t1).unwrap();
        let v2 = repo.create_pending("p1", "a", "m2", t2).unwrap();
        repo.complete(&v2.uid, Some("m".into()), None, false, 0, 0, "h2".into(), Some(v1.uid.clone()), VersionDiff::default(), t2).unwrap();

        let listed = repo.list_completed("p1");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].uid, v2.uid);
    }
}
