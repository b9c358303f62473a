//! # DownloadEngine
//!
//! Request-scoped, expiring archive artifacts: `request` coalesces active
//! or unexpired completed requests for `(version, actor)`, `build` is the
//! worker body that materializes the artifact, and `sweep` expires
//! completed requests past their `expires_at`.

use crate::archive;
use crate::config::Clock;
use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::ids::Uid;
use crate::restore::Restorer;
use crate::version::{DownloadRequest, DownloadStatus};
use crate::version_repo::VersionRepository;
use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const INDEX_KEY: &str = "downloads/_index.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DownloadIndex {
    requests: Vec<DownloadRequest>,
}

struct DownloadRepository {
    file_store: Arc<dyn FileStore>,
    index: Mutex<DownloadIndex>,
}

impl DownloadRepository {
    fn new(file_store: Arc<dyn FileStore>) -> Result<Self> {
        let index = if file_store.exists(INDEX_KEY) {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut file_store.open(INDEX_KEY)?, &mut buf)?;
            serde_json::from_slice(&buf)
                .map_err(|e| EngineError::internal(format!("loading download index: {e}")))?
        } else {
            DownloadIndex::default()
        };
        Ok(Self {
            file_store,
            index: Mutex::new(index),
        })
    }

    fn persist(&self, index: &DownloadIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)
            .map_err(|e| EngineError::internal(format!("serializing download index: {e}")))?;
        self.file_store.put(INDEX_KEY, &bytes)?;
        Ok(())
    }

    fn insert(&self, request: DownloadRequest) -> Result<()> {
        let mut index = self.index.lock();
        index.requests.push(request);
        self.persist(&index)
    }

    fn get(&self, uid: &Uid) -> Result<DownloadRequest> {
        let index = self.index.lock();
        index
            .requests
            .iter()
            .find(|r| &r.uid == uid)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("download {uid}")))
    }

    fn update<F: FnOnce(&mut DownloadRequest)>(&self, uid: &Uid, f: F) -> Result<DownloadRequest> {
        let mut index = self.index.lock();
        let req = index
            .requests
            .iter_mut()
            .find(|r| &r.uid == uid)
            .ok_or_else(|| EngineError::not_found(format!("download {uid}")))?;
        f(req);
        let updated = req.clone();
        self.persist(&index)?;
        Ok(updated)
    }

    fn delete(&self, uid: &Uid) -> Result<()> {
        let mut index = self.index.lock();
        let before = index.requests.len();
        index.requests.retain(|r| &r.uid != uid);
        if index.requests.len() == before {
            return Err(EngineError::not_found(format!("download {uid}")));
        }
        self.persist(&index)
    }

    /// The coalescing candidate for `(version, actor)`: an active request,
    /// or a completed one still within its expiration window.
    fn coalesce_candidate(&self, version: &Uid, actor: &str, now: chrono::DateTime<chrono::Utc>) -> Option<DownloadRequest> {
        let index = self.index.lock();
        index
            .requests
            .iter()
            .filter(|r| &r.version == version && r.requested_by == actor)
            .find(|r| match r.status {
                DownloadStatus::Pending | DownloadStatus::Processing => true,
                DownloadStatus::Completed => r.expires_at.map(|exp| exp > now).unwrap_or(false),
                DownloadStatus::Failed | DownloadStatus::Expired => false,
            })
            .cloned()
    }

    fn list_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<DownloadRequest> {
        let index = self.index.lock();
        index
            .requests
            .iter()
            .filter(|r| r.status == DownloadStatus::Completed)
            .filter(|r| r.expires_at.map(|exp| exp <= now).unwrap_or(false))
            .cloned()
            .collect()
    }
}

pub struct DownloadEngine {
    file_store: Arc<dyn FileStore>,
    version_repo: Arc<VersionRepository>,
    restorer: Arc<Restorer>,
    repo: DownloadRepository,
    clock: Arc<dyn Clock>,
    expiration_hours: i64,
}

impl DownloadEngine {
    pub fn new(
        file_store: Arc<dyn FileStore>,
        version_repo: Arc<VersionRepository>,
        restorer: Arc<Restorer>,
        clock: Arc<dyn Clock>,
        expiration_hours: i64,
    ) -> Result<Self> {
        Ok(Self {
            repo: DownloadRepository::new(Arc::clone(&file_store))?,
            file_store,
            version_repo,
            restorer,
            clock,
            expiration_hours,
        })
    }

    fn artifact_key(uid: &Uid) -> String {
        format!("downloads/{uid}/artifact.zip")
    }

    pub fn get(&self, uid: &Uid) -> Result<DownloadRequest> {
        self.repo.get(uid)
    }

    /// `request(version, actor)`: returns a coalesced request if one is
    /// still active or unexpired, otherwise creates a new pending one. Does
    /// not itself enqueue a worker task — the caller does that, mirroring
    /// how `PushEngine::submit` hands off to the `TaskQueue`.
    pub fn request(&self, version: &Uid, actor: &str) -> Result<DownloadRequest> {
        let now = self.clock.now();
        if let Some(existing) = self.repo.coalesce_candidate(version, actor, now) {
            return Ok(existing);
        }

        self.version_repo.get(version)?;
        let req = DownloadRequest {
            uid: Uid::generate(),
            version: version.clone(),
            requested_by: actor.to_string(),
            status: DownloadStatus::Pending,
            progress: 0,
            message: "queued".to_string(),
            artifact_ref: None,
            file_size: 0,
            created_at: now,
            completed_at: None,
            expires_at: None,
        };
        self.repo.insert(req.clone())?;
        Ok(req)
    }

    /// The worker body: builds the artifact for `download_uid` and
    /// transitions it to `completed`/`failed`.
    pub fn build(&self, download_uid: &Uid) -> Result<()> {
        let req = self.repo.get(download_uid)?;
        if req.status != DownloadStatus::Pending {
            return Ok(());
        }
        self.repo.update(download_uid, |r| {
            r.status = DownloadStatus::Processing;
            r.progress = 10;
            r.message = "materializing artifact".to_string();
        })?;

        match self.build_inner(&req) {
            Ok((key, size)) => {
                let now = self.clock.now();
                self.repo.update(download_uid, |r| {
                    r.status = DownloadStatus::Completed;
                    r.progress = 100;
                    r.message = "ready".to_string();
                    r.artifact_ref = Some(key);
                    r.file_size = size;
                    r.completed_at = Some(now);
                    r.expires_at = Some(now + Duration::hours(self.expiration_hours));
                })?;
                Ok(())
            }
            Err(e) => {
                self.repo.update(download_uid, |r| {
                    r.status = DownloadStatus::Failed;
                    r.message = format!("failed: {e}");
                })?;
                Err(e)
            }
        }
    }

    fn build_inner(&self, req: &DownloadRequest) -> Result<(String, u64)> {
        let version = self.version_repo.get(&req.version)?;
        let key = Self::artifact_key(&req.uid);

        if version.is_snapshot {
            let snapshot_ref = version
                .snapshot_ref
                .as_ref()
                .ok_or_else(|| EngineError::ManifestCorrupt(format!("version {} has no snapshot_ref", version.uid)))?;
            let tmp = std::env::temp_dir().join(format!("but-next-vcs-dl-{}-{}.zip", req.uid, std::process::id()));
            self.file_store.export_to_path(snapshot_ref, &tmp)?;
            let size = self.file_store.import_from_path(&key, &tmp)?;
            std::fs::remove_file(&tmp).ok();
            Ok((key, size))
        } else {
            let tmp_dir = std::env::temp_dir().join(format!("but-next-vcs-dl-{}-{}", req.uid, std::process::id()));
            std::fs::create_dir_all(&tmp_dir)?;
            let manifest_ref = version
                .manifest_ref
                .as_ref()
                .ok_or_else(|| EngineError::ManifestCorrupt(format!("version {} has no manifest_ref", version.uid)))?;
            let stats = self.restorer.restore_manifest(manifest_ref, &tmp_dir)?;
            if !stats.success() {
                std::fs::remove_dir_all(&tmp_dir).ok();
                return Err(EngineError::internal(format!(
                    "restore produced no files ({} errors)",
                    stats.errors.len()
                )));
            }

            let zip_tmp = std::env::temp_dir().join(format!("but-next-vcs-dl-{}-{}.zip", req.uid, std::process::id()));
            archive::zip_directory(&tmp_dir, &zip_tmp)?;
            let size = self.file_store.import_from_path(&key, &zip_tmp)?;
            std::fs::remove_dir_all(&tmp_dir).ok();
            std::fs::remove_file(&zip_tmp).ok();
            Ok((key, size))
        }
    }

    /// Deletes a `DownloadRequest` and its artifact, for the manual
    /// requester-initiated delete path.
    pub fn delete(&self, uid: &Uid) -> Result<()> {
        let req = self.repo.get(uid)?;
        if let Some(artifact) = &req.artifact_ref {
            self.file_store.delete(artifact)?;
        }
        self.repo.delete(uid)
    }

    /// Periodic sweep: expires completed requests past `expires_at` and
    /// deletes their artifact.
    pub fn sweep(&self) -> Result<u64> {
        let now = self.clock.now();
        let expired = self.repo.list_expired(now);
        for req in &expired {
            if let Some(artifact) = &req.artifact_ref {
                self.file_store.delete(artifact)?;
            }
            self.repo.update(&req.uid, |r| {
                r.status = DownloadStatus::Expired;
            })?;
        }
        Ok(expired.len() as u64)
    }
}
