//! # Version / Push / DownloadRequest data model
//!
//! Plain `serde`-derived records for the three entities `spec.md` §3
//! describes. There is no SQL database in this stack (the teacher crate has
//! none either); `VersionRepository` persists these as JSON documents
//! through `FileStore`, the same "metadata as files" layout the teacher
//! uses for its `Snapshot` manifests.

use crate::ids::Uid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file's worth of change, truncated into a version's `change_details`
/// buckets (`spec.md` §3, §4.6: ≤ `max_change_detail_entries` per bucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetail {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

/// A bounded bucket of `ChangeDetail`s plus whether entries were dropped.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangeBucket {
    pub entries: Vec<ChangeDetail>,
    pub truncated: bool,
}

impl ChangeBucket {
    pub fn from_all(mut all: Vec<ChangeDetail>, limit: usize) -> Self {
        all.sort_by(|a, b| a.path.cmp(&b.path));
        let truncated = all.len() > limit;
        all.truncate(limit);
        Self {
            entries: all,
            truncated,
        }
    }
}

/// Added/modified/deleted summary attached to a completed version, computed
/// by `DiffEngine` against the parent version (or against nothing, for the
/// first version of a project).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VersionDiff {
    pub files_added: u64,
    pub files_modified: u64,
    pub files_deleted: u64,
    pub size_change: i64,
    pub added: ChangeBucket,
    pub modified: ChangeBucket,
    pub deleted: ChangeBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A committed (or in-flight) snapshot of a project, per `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub uid: Uid,
    pub project: String,
    pub created_by: String,
    pub commit_message: String,
    pub status: VersionStatus,
    pub version_number: Option<u64>,
    pub is_snapshot: bool,
    pub snapshot_ref: Option<String>,
    pub manifest_ref: Option<String>,
    pub hash: Option<String>,
    pub file_size: u64,
    pub file_count: u64,
    pub previous_version: Option<Uid>,
    pub diff: VersionDiff,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Version {
    pub fn new_pending(project: &str, created_by: &str, commit_message: &str, now: DateTime<Utc>) -> Self {
        Self {
            uid: Uid::generate(),
            project: project.to_string(),
            created_by: created_by.to_string(),
            commit_message: commit_message.to_string(),
            status: VersionStatus::Pending,
            version_number: None,
            is_snapshot: false,
            snapshot_ref: None,
            manifest_ref: None,
            hash: None,
            file_size: 0,
            file_count: 0,
            previous_version: None,
            diff: VersionDiff::default(),
            created_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Processing,
    Done,
    Failed,
    Rejected,
    Cancelled,
}

impl PushStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PushStatus::Done | PushStatus::Failed | PushStatus::Rejected | PushStatus::Cancelled
        )
    }
}

/// One entry of an incoming push's file list (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFileEntry {
    pub relative_path: String,
    pub hash: String,
    pub size: Option<u64>,
    /// Opaque handle the caller resolves via `PushEngine::fetch_content` —
    /// a local staging path, a streamed upload handle, or a staging blob
    /// key. The spec treats upload transport as opaque; this crate models
    /// it as a filesystem path, the simplest concrete realization a local
    /// CLI harness and test suite need.
    pub local_path: Option<String>,
}

/// An in-flight ingestion (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    pub uid: Uid,
    pub project: String,
    pub created_by: String,
    pub commit_message: String,
    pub file_list: Vec<PushFileEntry>,
    pub status: PushStatus,
    pub progress: u8,
    pub message: String,
    pub error_details: Option<String>,
    pub version: Uid,
    pub created_at: DateTime<Utc>,
}

impl Push {
    pub fn set_progress(&mut self, progress: u8, message: impl Into<String>) {
        self.progress = progress.min(100);
        self.message = message.into();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

/// A materialization job producing a downloadable archive (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub uid: Uid,
    pub version: Uid,
    pub requested_by: String,
    pub status: DownloadStatus,
    pub progress: u8,
    pub message: String,
    pub artifact_ref: Option<String>,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}
