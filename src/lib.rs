//! # but-next-vcs
//!
//! A version-control backend for DAW project folders: a push/version
//! storage engine built from four interlocking subsystems — a push state
//! machine, content-addressed storage, a manifest/snapshot hybrid version
//! model with duplicate detection, and a restore/download pipeline.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!                    │ CLI (clap)   │
//!                    └──────┬───────┘
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │    Engine    │
//!                    └──────┬───────┘
//!              ┌────────────┼────────────┬─────────────┐
//!              ▼            ▼            ▼             ▼
//!        ┌───────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────┐
//!        │ PushEngine│ │ Restorer │ │ Download │ │VersionRepo   │
//!        │(state     │ │          │ │ Engine   │ │(manifests +  │
//!        │ machine)  │ │          │ │          │ │ version nos.)│
//!        └─────┬─────┘ └────┬─────┘ └────┬─────┘ └──────┬───────┘
//!              │            │            │              │
//!              ▼            ▼            ▼              ▼
//!        ┌───────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────┐
//!        │MasterTree │ │BlobStore │ │ DiffEngine│ │  FileStore   │
//!        │           │ │  (CAS)   │ │           │ │ (metadata as │
//!        └───────────┘ └──────────┘ └──────────┘ │  files, no DB)│
//!                                                 └──────────────┘
//! ```
//!
//! The engine owns none of its infrastructure: identity/authorization
//! (`AccessPolicy`), time (`Clock`), and background execution (`TaskQueue`)
//! are injected by whatever embeds this crate.

pub mod archive;
pub mod blob_store;
pub mod config;
pub mod diff;
pub mod download;
pub mod error;
pub mod file_store;
pub mod hasher;
pub mod ids;
pub mod ignore;
pub mod locks;
pub mod manifest;
pub mod master_tree;
pub mod push;
pub mod restore;
pub mod version;
pub mod version_repo;

use blob_store::BlobStore;
use config::{AccessPolicy, Clock, EngineConfig, ProjectContext, Task, TaskQueue};
use download::DownloadEngine;
use error::Result;
use file_store::FileStore;
use ids::Uid;
use push::{ContentFetcher, PushEngine};
use restore::{RestoreStats, Restorer};
use std::sync::Arc;
use version::{DownloadRequest, Push, PushFileEntry, Version};

/// Wires together the ten components into the operations a transport layer
/// calls. One `Engine` instance per `FileStore` root (ordinarily one per
/// deployment, or one per test).
pub struct Engine {
    version_repo: Arc<version_repo::VersionRepository>,
    push_engine: Arc<PushEngine>,
    restorer: Arc<Restorer>,
    download_engine: Arc<DownloadEngine>,
    access_policy: Arc<dyn AccessPolicy>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_store: Arc<dyn FileStore>,
        config: EngineConfig,
        access_policy: Arc<dyn AccessPolicy>,
        clock: Arc<dyn Clock>,
        task_queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Result<Self> {
        let blob_store = Arc::new(BlobStore::new(Arc::clone(&file_store))?);
        let version_repo = Arc::new(version_repo::VersionRepository::new(
            Arc::clone(&file_store),
            Arc::clone(&blob_store),
        )?);
        let restorer = Arc::new(Restorer::new(Arc::clone(&file_store), Arc::clone(&blob_store)));

        let push_engine = Arc::new(PushEngine::new(
            Arc::clone(&file_store),
            Arc::clone(&blob_store),
            Arc::clone(&version_repo),
            Arc::clone(&access_policy),
            Arc::clone(&clock),
            Arc::clone(&task_queue),
            fetcher,
            config.cas_threshold_bytes,
            config.snapshot_interval,
            config.max_change_detail_entries,
            config.repo_root.clone(),
        )?);

        let download_engine = Arc::new(DownloadEngine::new(
            Arc::clone(&file_store),
            Arc::clone(&version_repo),
            Arc::clone(&restorer),
            Arc::clone(&clock),
            config.download_expiration_hours,
        )?);

        Ok(Self {
            version_repo,
            push_engine,
            restorer,
            download_engine,
            access_policy,
        })
    }

    // ── Push operations (spec.md §6) ────────────────────────────────────

    pub fn submit_push(
        &self,
        project: &ProjectContext,
        actor: &str,
        commit_message: &str,
        file_list: Vec<PushFileEntry>,
    ) -> Result<Push> {
        self.push_engine.submit(project, actor, commit_message, file_list)
    }

    pub fn get_push(&self, push_uid: &Uid) -> Result<Push> {
        self.push_engine.get(push_uid)
    }

    pub fn approve_push(&self, push_uid: &Uid, project: &ProjectContext, approver: &str) -> Result<Push> {
        self.push_engine.approve(push_uid, project, approver)
    }

    pub fn reject_push(&self, push_uid: &Uid, project: &ProjectContext, approver: &str, reason: &str) -> Result<Push> {
        self.push_engine.reject(push_uid, project, approver, reason)
    }

    pub fn cancel_push(&self, push_uid: &Uid, project: &ProjectContext, actor: &str) -> Result<Push> {
        self.push_engine.cancel(push_uid, project, actor)
    }

    /// Runs a queued push synchronously. A `TaskQueue` handler calls this
    /// for `Task::RunPush`; the CLI harness calls it directly in lieu of a
    /// background worker.
    pub fn run_push(&self, push_uid: &Uid, project: &ProjectContext) -> Result<()> {
        self.push_engine.run_push(push_uid, project)
    }

    // ── Version operations ──────────────────────────────────────────────

    pub fn list_versions(&self, project: &str, include_processing: bool) -> Vec<Version> {
        if include_processing {
            self.version_repo.list_all(project)
        } else {
            self.version_repo.list_completed(project)
        }
    }

    pub fn get_version(&self, version_uid: &Uid) -> Result<Version> {
        self.version_repo.get(version_uid)
    }

    pub fn delete_version(&self, version_uid: &Uid, project: &ProjectContext, actor: &str) -> Result<()> {
        if !self.access_policy.is_owner(project, actor) {
            return Err(error::EngineError::PermissionDenied);
        }
        self.version_repo.delete(version_uid)
    }

    /// Per-file metadata for a completed version, for the `ListFiles`
    /// operation. Snapshot-backed versions have no manifest to read; the
    /// caller is expected to restore and walk the tree instead.
    pub fn list_files(&self, version_uid: &Uid) -> Result<Vec<manifest::FileEntry>> {
        let version = self.version_repo.get(version_uid)?;
        match &version.manifest_ref {
            Some(manifest_ref) => {
                let mut buf = Vec::new();
                std::io::Read::read_to_end(&mut self.restorer_file_store().open(manifest_ref)?, &mut buf)?;
                Ok(manifest::ManifestCodec::decode(&buf)?.files)
            }
            None => Err(error::EngineError::invalid_state(
                "version is snapshot-backed; restore it to list files",
            )),
        }
    }

    fn restorer_file_store(&self) -> &dyn FileStore {
        self.restorer.file_store()
    }

    // ── Restore / download operations ───────────────────────────────────

    pub fn restore_version(&self, version_uid: &Uid, target_dir: &std::path::Path) -> Result<RestoreStats> {
        let version = self.version_repo.get(version_uid)?;
        if version.is_snapshot {
            let snapshot_ref = version
                .snapshot_ref
                .as_ref()
                .ok_or_else(|| error::EngineError::ManifestCorrupt(format!("version {version_uid} has no snapshot_ref")))?;
            self.restorer.restore_snapshot(snapshot_ref, target_dir)
        } else {
            let manifest_ref = version
                .manifest_ref
                .as_ref()
                .ok_or_else(|| error::EngineError::ManifestCorrupt(format!("version {version_uid} has no manifest_ref")))?;
            self.restorer.restore_manifest(manifest_ref, target_dir)
        }
    }

    pub fn request_download(&self, version_uid: &Uid, actor: &str) -> Result<DownloadRequest> {
        self.download_engine.request(version_uid, actor)
    }

    pub fn get_download(&self, download_uid: &Uid) -> Result<DownloadRequest> {
        self.download_engine.get(download_uid)
    }

    /// Runs a queued download build synchronously. A `TaskQueue` handler
    /// calls this for `Task::BuildDownload`.
    pub fn build_download(&self, download_uid: &Uid) -> Result<()> {
        self.download_engine.build(download_uid)
    }

    /// `FetchArtifact`: opens the completed artifact for streaming.
    pub fn fetch_artifact(&self, download_uid: &Uid) -> Result<Box<dyn std::io::Read + Send>> {
        let req = self.download_engine.get(download_uid)?;
        let artifact_ref = req
            .artifact_ref
            .as_ref()
            .ok_or_else(|| error::EngineError::invalid_state("download has no completed artifact"))?;
        self.restorer_file_store().open(artifact_ref)
    }

    pub fn delete_download(&self, download_uid: &Uid) -> Result<()> {
        self.download_engine.delete(download_uid)
    }

    /// Periodic sweeps a caller-owned scheduler should run at
    /// `EngineConfig::blob_sweep_interval_minutes`: CAS garbage collection
    /// and download artifact expiry.
    pub fn sweep_blobs(&self) -> Result<u64> {
        self.sweep_blob_store().sweep()
    }

    pub fn sweep_downloads(&self) -> Result<u64> {
        self.download_engine.sweep()
    }

    fn sweep_blob_store(&self) -> &BlobStore {
        self.push_engine.blob_store()
    }

    /// Invoked by a `TaskQueue` handler when a task is dequeued.
    pub fn handle_task(&self, task: Task, project: &ProjectContext) -> Result<()> {
        match task {
            Task::RunPush { push_uid } => self.run_push(&push_uid, project),
            Task::BuildDownload { download_uid } => self.build_download(&download_uid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{OwnerOnlyAccessPolicy, SystemClock};
    use file_store::LocalFileStore;
    use push::LocalPathFetcher;

    struct NoopQueue;
    impl TaskQueue for NoopQueue {
        fn enqueue(&self, _task: Task) {}
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("but-next-vcs-lib-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine(dir: &std::path::Path) -> Engine {
        let fs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir));
        Engine::new(
            fs,
            EngineConfig::default(),
            Arc::new(OwnerOnlyAccessPolicy),
            Arc::new(SystemClock),
            Arc::new(NoopQueue),
            Arc::new(LocalPathFetcher),
        )
        .unwrap()
    }

    #[test]
    fn end_to_end_push_list_restore_download() {
        let dir = temp_dir("e2e");
        let staging = temp_dir("e2e-staging");
        let eng = engine(&dir);
        let project = ProjectContext {
            id: "proj".into(),
            owner: "alice".into(),
            requires_approval: false,
            ignore_patterns: vec![],
        };

        let path = staging.join("song.flp");
        std::fs::write(&path, b"melody data").unwrap();
        let entry = PushFileEntry {
            relative_path: "song.flp".into(),
            hash: hasher::hash_bytes(b"melody data"),
            size: Some(11),
            local_path: Some(path.to_string_lossy().to_string()),
        };

        let push = eng.submit_push(&project, "alice", "first take", vec![entry]).unwrap();
        eng.run_push(&push.uid, &project).unwrap();
        let done = eng.get_push(&push.uid).unwrap();
        assert_eq!(done.status, version::PushStatus::Done);

        let versions = eng.list_versions(&project.id, false);
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_number, Some(1));

        let files = eng.list_files(&versions[0].uid).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "song.flp");

        let restore_dir = temp_dir("e2e-restore");
        let stats = eng.restore_version(&versions[0].uid, &restore_dir).unwrap();
        assert!(stats.success());
        assert_eq!(std::fs::read(restore_dir.join("song.flp")).unwrap(), b"melody data");

        let download = eng.request_download(&versions[0].uid, "alice").unwrap();
        eng.build_download(&download.uid).unwrap();
        let completed = eng.get_download(&download.uid).unwrap();
        assert_eq!(completed.status, version::DownloadStatus::Completed);

        let mut artifact = eng.fetch_artifact(&download.uid).unwrap();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut artifact, &mut buf).unwrap();
        assert!(!buf.is_empty());

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
        std::fs::remove_dir_all(&restore_dir).ok();
    }

    #[test]
    fn non_owner_cannot_delete_a_version() {
        let dir = temp_dir("perm");
        let eng = engine(&dir);
        let project = ProjectContext {
            id: "proj".into(),
            owner: "alice".into(),
            requires_approval: false,
            ignore_patterns: vec![],
        };
        let version = eng
            .version_repo
            .create_pending(&project.id, "alice", "m", chrono::Utc::now())
            .unwrap();
        let err = eng.delete_version(&version.uid, &project, "mallory").unwrap_err();
        assert!(matches!(err, error::EngineError::PermissionDenied));
        std::fs::remove_dir_all(&dir).ok();
    }
}
