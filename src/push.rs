//! # PushEngine
//!
//! The state machine in `spec.md` §4.7: `submit`/`approve`/`reject`/`cancel`
//! drive a `Push` through `pending|awaiting_approval|approved -> processing
//! -> done|failed`, with `cancelled`/`rejected` reachable from any
//! non-terminal state. `run_push` is the worker body a `TaskQueue` handler
//! invokes, and is the core algorithm this crate exists to implement:
//! reconcile the master tree, build a manifest, dedupe-check it, and either
//! attach it to an existing version or commit a new one.

use crate::blob_store::BlobStore;
use crate::config::{AccessPolicy, Clock, ProjectContext, Task, TaskQueue};
use crate::diff;
use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::hasher;
use crate::ids::Uid;
use crate::ignore::IgnoreMatcher;
use crate::locks::KeyedLocks;
use crate::manifest::{FileEntry, ManifestCodec};
use crate::master_tree::MasterTree;
use crate::version::{Push, PushFileEntry, PushStatus, VersionDiff};
use crate::version_repo::VersionRepository;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INDEX_KEY: &str = "pushes/_index.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PushIndex {
    pushes: Vec<Push>,
}

/// Persistence for `Push` records, following the same JSON-index-through-
/// `FileStore` pattern as `VersionRepository` and `BlobStore`.
struct PushRepository {
    file_store: Arc<dyn FileStore>,
    index: Mutex<PushIndex>,
}

impl PushRepository {
    fn new(file_store: Arc<dyn FileStore>) -> Result<Self> {
        let index = if file_store.exists(INDEX_KEY) {
            let mut buf = Vec::new();
            file_store.open(INDEX_KEY)?.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf)
                .map_err(|e| EngineError::internal(format!("loading push index: {e}")))?
        } else {
            PushIndex::default()
        };
        Ok(Self {
            file_store,
            index: Mutex::new(index),
        })
    }

    fn persist(&self, index: &PushIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)
            .map_err(|e| EngineError::internal(format!("serializing push index: {e}")))?;
        self.file_store.put(INDEX_KEY, &bytes)?;
        Ok(())
    }

    fn insert(&self, push: Push) -> Result<()> {
        let mut index = self.index.lock();
        index.pushes.push(push);
        self.persist(&index)
    }

    fn get(&self, uid: &Uid) -> Result<Push> {
        let index = self.index.lock();
        index
            .pushes
            .iter()
            .find(|p| &p.uid == uid)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("push {uid}")))
    }

    fn update<F: FnOnce(&mut Push)>(&self, uid: &Uid, f: F) -> Result<Push> {
        let mut index = self.index.lock();
        let push = index
            .pushes
            .iter_mut()
            .find(|p| &p.uid == uid)
            .ok_or_else(|| EngineError::not_found(format!("push {uid}")))?;
        f(push);
        let updated = push.clone();
        self.persist(&index)?;
        Ok(updated)
    }
}

/// Resolves the raw bytes for one push file-list entry. The spec treats
/// upload transport as opaque; this crate models a resolved entry as a
/// plain filesystem path the caller staged the upload to.
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, entry: &PushFileEntry) -> Result<Box<dyn Read>>;
}

/// The obvious fetcher for a local CLI harness / test suite: reads
/// `entry.local_path` directly off disk.
pub struct LocalPathFetcher;

impl ContentFetcher for LocalPathFetcher {
    fn fetch(&self, entry: &PushFileEntry) -> Result<Box<dyn Read>> {
        let path = entry
            .local_path
            .as_ref()
            .ok_or_else(|| EngineError::internal(format!("no content source for {}", entry.relative_path)))?;
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

pub struct PushEngine {
    file_store: Arc<dyn FileStore>,
    blob_store: Arc<BlobStore>,
    version_repo: Arc<VersionRepository>,
    push_repo: PushRepository,
    project_locks: KeyedLocks<String>,
    access_policy: Arc<dyn AccessPolicy>,
    clock: Arc<dyn Clock>,
    task_queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn ContentFetcher>,
    cas_threshold_bytes: u64,
    snapshot_interval: u64,
    max_change_detail_entries: usize,
    repo_root: PathBuf,
}

impl PushEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_store: Arc<dyn FileStore>,
        blob_store: Arc<BlobStore>,
        version_repo: Arc<VersionRepository>,
        access_policy: Arc<dyn AccessPolicy>,
        clock: Arc<dyn Clock>,
        task_queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn ContentFetcher>,
        cas_threshold_bytes: u64,
        snapshot_interval: u64,
        max_change_detail_entries: usize,
        repo_root: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            push_repo: PushRepository::new(Arc::clone(&file_store))?,
            file_store,
            blob_store,
            version_repo,
            project_locks: KeyedLocks::new(),
            access_policy,
            clock,
            task_queue,
            fetcher,
            cas_threshold_bytes,
            snapshot_interval,
            max_change_detail_entries,
            repo_root,
        })
    }

    fn master_tree_root(&self, project: &str) -> PathBuf {
        self.repo_root.join("master").join(project)
    }

    fn manifest_key(project: &str, version: &Uid) -> String {
        format!("projects/{project}/versions/{version}/manifest.json")
    }

    fn snapshot_key(project: &str, version: &Uid) -> String {
        format!("projects/{project}/versions/{version}/snapshot.zip")
    }

    pub fn get(&self, uid: &Uid) -> Result<Push> {
        self.push_repo.get(uid)
    }

    /// The blob store backing this engine's pushes, for callers that need
    /// to run CAS maintenance (`Engine::sweep_blobs`).
    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// `spec.md` §4.7 `submit`. Creates the placeholder `Version` and the
    /// `Push`, enqueuing `runPush` unless the project requires approval
    /// from someone other than the actor.
    pub fn submit(
        &self,
        project: &ProjectContext,
        actor: &str,
        commit_message: &str,
        file_list: Vec<PushFileEntry>,
    ) -> Result<Push> {
        if !self.access_policy.can_edit(project, actor) {
            return Err(EngineError::PermissionDenied);
        }

        let now = self.clock.now();
        let version = self
            .version_repo
            .create_pending(&project.id, actor, commit_message, now)?;

        let needs_approval = project.requires_approval && !self.access_policy.is_owner(project, actor);
        let status = if needs_approval {
            PushStatus::AwaitingApproval
        } else {
            PushStatus::Pending
        };

        let push = Push {
            uid: Uid::generate(),
            project: project.id.clone(),
            created_by: actor.to_string(),
            commit_message: commit_message.to_string(),
            file_list,
            status,
            progress: 0,
            message: if needs_approval {
                "awaiting approval".to_string()
            } else {
                "queued".to_string()
            },
            error_details: None,
            version: version.uid.clone(),
            created_at: now,
        };
        self.push_repo.insert(push.clone())?;

        if status == PushStatus::Pending {
            self.task_queue.enqueue(Task::RunPush {
                push_uid: push.uid.clone(),
            });
        }
        Ok(push)
    }

    /// `spec.md` §4.7 `approve`.
    pub fn approve(&self, push_uid: &Uid, project: &ProjectContext, approver: &str) -> Result<Push> {
        if !self.access_policy.is_owner(project, approver) {
            return Err(EngineError::PermissionDenied);
        }
        let current = self.push_repo.get(push_uid)?;
        if current.status != PushStatus::AwaitingApproval {
            return Err(EngineError::invalid_state(format!(
                "cannot approve push in state {:?}",
                current.status
            )));
        }
        let updated = self.push_repo.update(push_uid, |p| {
            p.status = PushStatus::Approved;
            p.set_progress(0, "approved, queued");
        })?;
        self.task_queue.enqueue(Task::RunPush {
            push_uid: push_uid.clone(),
        });
        Ok(updated)
    }

    /// `spec.md` §4.7 `reject`.
    pub fn reject(&self, push_uid: &Uid, project: &ProjectContext, approver: &str, reason: &str) -> Result<Push> {
        if !self.access_policy.is_owner(project, approver) {
            return Err(EngineError::PermissionDenied);
        }
        let current = self.push_repo.get(push_uid)?;
        if current.status != PushStatus::AwaitingApproval {
            return Err(EngineError::invalid_state(format!(
                "cannot reject push in state {:?}",
                current.status
            )));
        }
        self.version_repo.delete(&current.version)?;
        self.push_repo.update(push_uid, |p| {
            p.status = PushStatus::Rejected;
            p.error_details = Some(reason.to_string());
            p.set_progress(100, format!("rejected: {reason}"));
        })
    }

    /// `spec.md` §4.7 `cancel`. Allowed for the push's creator or the
    /// project owner while the push is non-terminal.
    pub fn cancel(&self, push_uid: &Uid, project: &ProjectContext, actor: &str) -> Result<Push> {
        let current = self.push_repo.get(push_uid)?;
        if current.status.is_terminal() {
            return Err(EngineError::invalid_state("push is already terminal"));
        }
        if actor != current.created_by && !self.access_policy.is_owner(project, actor) {
            return Err(EngineError::PermissionDenied);
        }
        // If the worker hasn't started, there is no in-flight acquisition to
        // compensate yet; delete the placeholder right away. If the worker
        // is running, it observes the `Cancelled` status at its next
        // checkpoint and runs the same compensation itself.
        if current.status != PushStatus::Processing {
            self.version_repo.delete(&current.version).ok();
        }
        self.push_repo.update(push_uid, |p| {
            p.status = PushStatus::Cancelled;
            p.set_progress(p.progress, "cancelled");
        })
    }

    /// The worker body: `spec.md` §4.7 `runPush`. Blocking; intended to run
    /// on a `TaskQueue` worker thread.
    pub fn run_push(&self, push_uid: &Uid, project: &ProjectContext) -> Result<()> {
        let lock = self.project_locks.get(&project.id);
        let _guard = lock.lock();

        let push = self.push_repo.get(push_uid)?;
        if push.status == PushStatus::Cancelled {
            return Ok(());
        }

        match self.run_push_inner(&push, project) {
            Ok(()) => Ok(()),
            Err(EngineError::Cancelled) => {
                self.compensate(&push, &[]).ok();
                self.push_repo
                    .update(push_uid, |p| {
                        p.status = PushStatus::Cancelled;
                        p.set_progress(p.progress, "cancelled");
                    })
                    .ok();
                Ok(())
            }
            Err(e) => {
                self.version_repo.fail(&push.version, e.to_string()).ok();
                self.push_repo
                    .update(push_uid, |p| {
                        p.status = PushStatus::Failed;
                        p.error_details = Some(e.to_string());
                        p.set_progress(p.progress, format!("failed: {e}"));
                    })
                    .ok();
                Err(e)
            }
        }
    }

    fn compensate(&self, push: &Push, acquired_hashes: &[String]) -> Result<()> {
        self.blob_store.release_all(&push.version, acquired_hashes)?;
        self.version_repo.delete(&push.version).ok();
        Ok(())
    }

    /// Checkpoint a worker must hit between major steps (`spec.md` §5) and
    /// at a bounded per-file cadence within a step, so a `cancel` is
    /// observed within at most one file-unit of work (`spec.md` §8
    /// property 6). Compensates any blobs already acquired by this push
    /// before surfacing `Cancelled`, since the caller's own `acquired`
    /// local is lost once this returns an error.
    fn check_cancelled(&self, push: &Push, acquired: &[String]) -> Result<()> {
        let cancelled = self
            .push_repo
            .get(&push.uid)
            .map(|p| p.status == PushStatus::Cancelled)
            .unwrap_or(false);
        if cancelled {
            self.compensate(push, acquired)?;
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn run_push_inner(&self, push: &Push, project: &ProjectContext) -> Result<()> {
        self.version_repo.set_processing(&push.version)?;
        self.push_repo.update(&push.uid, |p| {
            p.status = PushStatus::Processing;
            p.set_progress(5, "reconciling master tree");
        })?;

        let ignore = IgnoreMatcher::new(project.ignore_patterns.iter().cloned());
        let filtered: Vec<PushFileEntry> = push
            .file_list
            .iter()
            .filter(|e| !e.relative_path.trim().is_empty())
            .filter(|e| !ignore.is_ignored(&e.relative_path))
            .cloned()
            .collect();

        let tree = MasterTree::new(self.master_tree_root(&project.id));
        let mut acquired: Vec<String> = Vec::new();

        let fetcher = Arc::clone(&self.fetcher);
        tree.reconcile(
            &filtered,
            |entry| fetcher.fetch(entry),
            || self.push_repo.get(&push.uid).map(|p| p.status == PushStatus::Cancelled).unwrap_or(false),
        )?;
        self.push_repo.update(&push.uid, |p| p.set_progress(15, "reconciled"))?;
        self.check_cancelled(push, &[])?;

        let mut manifest_entries: Vec<FileEntry> = Vec::with_capacity(filtered.len());
        let root = self.master_tree_root(&project.id);
        for (i, entry) in filtered.iter().enumerate() {
            if i % 10 == 0 {
                self.check_cancelled(push, &acquired)?;
            }
            let path = root.join(crate::manifest::normalize_path(&entry.relative_path));
            let size = std::fs::metadata(&path)?.len();
            let hash = hasher::hash_file(&path)?;

            if size > self.cas_threshold_bytes {
                let mut file = std::fs::File::open(&path)?;
                let (stored_hash, _, _) = self.blob_store.store(&mut file, Some(&entry.hash))?;
                self.blob_store.acquire(&stored_hash, &push.version, &project.id)?;
                acquired.push(stored_hash.clone());
                manifest_entries.push(FileEntry::cas(entry.relative_path.clone(), stored_hash.clone(), size, stored_hash));
            } else if hash != entry.hash {
                return Err(EngineError::HashMismatch {
                    expected: entry.hash.clone(),
                    computed: hash,
                });
            } else {
                let bytes = std::fs::read(&path)?;
                let content = base64::engine::general_purpose::STANDARD.encode(bytes);
                manifest_entries.push(FileEntry::inline(entry.relative_path.clone(), hash, size, content));
            }
        }
        self.push_repo.update(&push.uid, |p| p.set_progress(55, "manifest built"))?;
        self.check_cancelled(push, &acquired)?;

        let manifest_hash = ManifestCodec::manifest_hash(&manifest_entries);
        self.push_repo.update(&push.uid, |p| p.set_progress(65, "checking for duplicate version"))?;

        if let Some(existing) = self.version_repo.find_completed_by_hash(&project.id, &manifest_hash) {
            self.compensate(push, &acquired)?;
            self.push_repo.update(&push.uid, |p| {
                p.version = existing.uid.clone();
                p.status = PushStatus::Done;
                p.set_progress(
                    100,
                    format!("no changes; matches version {}", existing.version_number.unwrap_or(0)),
                );
            })?;
            return Ok(());
        }

        let parent = self.version_repo.latest_completed(&project.id, &push.version);
        let parent_entries: Option<Vec<FileEntry>> = match &parent {
            Some(p) => match &p.manifest_ref {
                Some(manifest_ref) => {
                    let mut buf = Vec::new();
                    self.file_store.open(manifest_ref)?.read_to_end(&mut buf)?;
                    Some(ManifestCodec::decode(&buf)?.files)
                }
                None => None,
            },
            None => None,
        };
        let version_diff: VersionDiff = diff::diff(
            &manifest_entries,
            parent_entries.as_deref(),
            self.max_change_detail_entries,
        );

        self.check_cancelled(push, &acquired)?;

        let n = 1 + self.version_repo.count_completed(&project.id);
        let is_snapshot = n % self.snapshot_interval == 0;
        self.push_repo.update(&push.uid, |p| {
            p.set_progress(80, if is_snapshot { "building snapshot archive" } else { "persisting manifest" })
        })?;

        let (manifest_ref, snapshot_ref) = if is_snapshot {
            let zip_tmp = self
                .repo_root
                .join(format!("tmp-push-{}-{}.zip", push.version, std::process::id()));
            crate::archive::zip_directory(&root, &zip_tmp)?;
            let key = Self::snapshot_key(&project.id, &push.version);
            self.file_store.import_from_path(&key, &zip_tmp)?;
            std::fs::remove_file(&zip_tmp).ok();
            (None, Some(key))
        } else {
            let bytes = ManifestCodec::encode(&manifest_entries, self.cas_threshold_bytes, self.clock.now())?;
            let key = Self::manifest_key(&project.id, &push.version);
            self.file_store.put(&key, &bytes)?;
            (Some(key), None)
        };

        let file_size: u64 = manifest_entries.iter().map(|e| e.size).sum();
        let file_count = manifest_entries.len() as u64;

        self.version_repo.complete(
            &push.version,
            manifest_ref,
            snapshot_ref,
            is_snapshot,
            file_count,
            file_size,
            manifest_hash,
            parent.map(|p| p.uid),
            version_diff,
            self.clock.now(),
        )?;

        self.push_repo.update(&push.uid, |p| {
            p.status = PushStatus::Done;
            p.set_progress(100, "done");
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OwnerOnlyAccessPolicy, SystemClock, ThreadPoolQueue};
    use crate::file_store::LocalFileStore;

    struct NoopQueue;
    impl TaskQueue for NoopQueue {
        fn enqueue(&self, _task: Task) {}
    }

    fn engine(dir: &Path) -> (PushEngine, Arc<dyn FileStore>) {
        let fs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir));
        let blobs = Arc::new(BlobStore::new(Arc::clone(&fs)).unwrap());
        let versions = Arc::new(VersionRepository::new(Arc::clone(&fs), Arc::clone(&blobs)).unwrap());
        let engine = PushEngine::new(
            Arc::clone(&fs),
            blobs,
            versions,
            Arc::new(OwnerOnlyAccessPolicy),
            Arc::new(SystemClock),
            Arc::new(NoopQueue),
            Arc::new(LocalPathFetcher),
            1_048_576,
            10,
            50,
            dir.to_path_buf(),
        )
        .unwrap();
        (engine, fs)
    }

    fn stage_file(dir: &Path, name: &str, content: &[u8]) -> PushFileEntry {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        PushFileEntry {
            relative_path: name.to_string(),
            hash: hasher::hash_bytes(content),
            size: Some(content.len() as u64),
            local_path: Some(path.to_string_lossy().to_string()),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("but-next-vcs-push-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn project(requires_approval: bool) -> ProjectContext {
        ProjectContext {
            id: "proj1".into(),
            owner: "alice".into(),
            requires_approval,
            ignore_patterns: vec![],
        }
    }

    #[test]
    fn submit_and_run_creates_first_version() {
        let dir = temp_dir("submit-run");
        let staging = temp_dir("submit-run-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(false);

        let entry = stage_file(&staging, "readme.txt", b"hello world");
        let push = engine.submit(&project, "alice", "first", vec![entry]).unwrap();
        assert_eq!(push.status, PushStatus::Pending);

        engine.run_push(&push.uid, &project).unwrap();
        let done = engine.get(&push.uid).unwrap();
        assert_eq!(done.status, PushStatus::Done);

        let version = engine.version_repo.get(&done.version).unwrap();
        assert_eq!(version.version_number, Some(1));
        assert_eq!(version.file_count, 1);
        assert!(!version.is_snapshot);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[test]
    fn duplicate_push_reuses_existing_version() {
        let dir = temp_dir("dup");
        let staging = temp_dir("dup-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(false);

        let entry = stage_file(&staging, "readme.txt", b"hello world");
        let push1 = engine.submit(&project, "alice", "first", vec![entry.clone()]).unwrap();
        engine.run_push(&push1.uid, &project).unwrap();
        let v1 = engine.get(&push1.uid).unwrap().version;

        let push2 = engine.submit(&project, "alice", "again", vec![entry]).unwrap();
        engine.run_push(&push2.uid, &project).unwrap();
        let done2 = engine.get(&push2.uid).unwrap();
        assert_eq!(done2.status, PushStatus::Done);
        assert_eq!(done2.version, v1);
        assert_eq!(engine.version_repo.count_completed(&project.id), 1);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[test]
    fn approval_required_blocks_non_owner_until_approved() {
        let dir = temp_dir("approval");
        let staging = temp_dir("approval-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(true);

        let entry = stage_file(&staging, "a.txt", b"data");
        let push = engine.submit(&project, "bob", "bob's push", vec![entry]).unwrap();
        assert_eq!(push.status, PushStatus::AwaitingApproval);

        let approved = engine.approve(&push.uid, &project, "alice").unwrap();
        assert_eq!(approved.status, PushStatus::Approved);

        engine.run_push(&push.uid, &project).unwrap();
        assert_eq!(engine.get(&push.uid).unwrap().status, PushStatus::Done);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[test]
    fn rejecting_a_push_deletes_the_placeholder_version() {
        let dir = temp_dir("reject");
        let staging = temp_dir("reject-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(true);

        let entry = stage_file(&staging, "a.txt", b"data");
        let push = engine.submit(&project, "bob", "bob's push", vec![entry]).unwrap();
        let version_uid = push.version.clone();

        let rejected = engine.reject(&push.uid, &project, "alice", "no").unwrap();
        assert_eq!(rejected.status, PushStatus::Rejected);
        assert!(engine.version_repo.get(&version_uid).is_err());

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[test]
    fn hash_mismatch_fails_the_push() {
        let dir = temp_dir("hashmismatch");
        let staging = temp_dir("hashmismatch-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(false);

        let mut entry = stage_file(&staging, "a.txt", b"data");
        entry.hash = "0000000000000000000000000000000000000000000000000000000000000000".to_string();
        let push = engine.submit(&project, "alice", "bad", vec![entry]).unwrap();
        assert!(engine.run_push(&push.uid, &project).is_err());
        assert_eq!(engine.get(&push.uid).unwrap().status, PushStatus::Failed);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[test]
    fn snapshot_interval_boundary() {
        let dir = temp_dir("snapshot-boundary");
        let staging = temp_dir("snapshot-boundary-staging");
        let (engine, _fs) = engine(&dir);
        let project = project(false);

        for i in 0..3 {
            let entry = stage_file(&staging, "f.txt", format!("content-{i}").as_bytes());
            let push = engine.submit(&project, "alice", "msg", vec![entry]).unwrap();
            engine.run_push(&push.uid, &project).unwrap();
        }

        let versions = engine.version_repo.list_completed(&project.id);
        assert_eq!(versions.len(), 3);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }
}
