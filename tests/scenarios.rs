//! End-to-end scenarios S1-S6 from the push/version storage engine's
//! testable-properties section: a full push/dedupe/modify/delete/snapshot/
//! approval cycle driven directly against `PushEngine`, `BlobStore`, and
//! `VersionRepository` (bypassing the `Engine` facade for white-box access
//! to blob ref counts and payload presence, the way `push.rs`'s own unit
//! tests do).

use but_next_vcs::blob_store::BlobStore;
use but_next_vcs::config::{OwnerOnlyAccessPolicy, ProjectContext, SystemClock, Task, TaskQueue};
use but_next_vcs::file_store::{FileStore, LocalFileStore};
use but_next_vcs::hasher;
use but_next_vcs::push::{LocalPathFetcher, PushEngine};
use but_next_vcs::version::{PushFileEntry, PushStatus, VersionStatus};
use but_next_vcs::version_repo::VersionRepository;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct NoopQueue;
impl TaskQueue for NoopQueue {
    fn enqueue(&self, _task: Task) {}
}

struct Harness {
    engine: PushEngine,
    blobs: Arc<BlobStore>,
    versions: Arc<VersionRepository>,
    store: Arc<dyn FileStore>,
    dir: PathBuf,
    staging: PathBuf,
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "but-next-vcs-scenarios-{name}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn harness(name: &str, cas_threshold_bytes: u64, snapshot_interval: u64) -> Harness {
    let dir = temp_dir(name);
    let staging = temp_dir(&format!("{name}-staging"));
    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&dir));
    let blobs = Arc::new(BlobStore::new(Arc::clone(&store)).unwrap());
    let versions = Arc::new(VersionRepository::new(Arc::clone(&store), Arc::clone(&blobs)).unwrap());
    let engine = PushEngine::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        Arc::clone(&versions),
        Arc::new(OwnerOnlyAccessPolicy),
        Arc::new(SystemClock),
        Arc::new(NoopQueue),
        Arc::new(LocalPathFetcher),
        cas_threshold_bytes,
        snapshot_interval,
        50,
        dir.clone(),
    )
    .unwrap();
    Harness {
        engine,
        blobs,
        versions,
        store,
        dir,
        staging,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
        std::fs::remove_dir_all(&self.staging).ok();
    }
}

fn project(requires_approval: bool) -> ProjectContext {
    ProjectContext {
        id: "daw-project".into(),
        owner: "alice".into(),
        requires_approval,
        ignore_patterns: vec![],
    }
}

fn stage(dir: &Path, name: &str, content: &[u8]) -> PushFileEntry {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    PushFileEntry {
        relative_path: name.to_string(),
        hash: hasher::hash_bytes(content),
        size: Some(content.len() as u64),
        local_path: Some(path.to_string_lossy().to_string()),
    }
}

/// S1 — initial push: a 2 MiB file (goes to CAS) plus a small inline file.
#[test]
fn s1_initial_push_creates_version_one_with_one_new_blob() {
    let h = harness("s1", 1_048_576, 10);
    let project = project(false);

    let song = vec![0xAAu8; 2_097_152];
    let song_entry = stage(&h.staging, "song.flp", &song);
    let readme_entry = stage(&h.staging, "readme.txt", b"hello world!");

    let push = h
        .engine
        .submit(&project, "alice", "first take", vec![song_entry.clone(), readme_entry.clone()])
        .unwrap();
    h.engine.run_push(&push.uid, &project).unwrap();

    let done = h.engine.get(&push.uid).unwrap();
    assert_eq!(done.status, PushStatus::Done);

    let v1 = h.versions.get(&done.version).unwrap();
    assert_eq!(v1.status, VersionStatus::Completed);
    assert_eq!(v1.version_number, Some(1));
    assert_eq!(v1.diff.files_added, 2);
    assert_eq!(v1.diff.files_modified, 0);
    assert_eq!(v1.diff.files_deleted, 0);
    assert!(!v1.is_snapshot);
    assert_eq!(v1.file_count, 2);

    assert_eq!(h.blobs.ref_count(&song_entry.hash), 1);
    assert!(h.blobs.exists(&song_entry.hash));
}

/// S2 — immediately resubmitting S1's identical file list: no new version,
/// blob ref count unchanged.
#[test]
fn s2_duplicate_push_reuses_v1_without_new_blobs() {
    let h = harness("s2", 1_048_576, 10);
    let project = project(false);

    let song = vec![0xAAu8; 2_097_152];
    let song_entry1 = stage(&h.staging, "song.flp", &song);
    let readme_entry1 = stage(&h.staging, "readme.txt", b"hello world!");
    let push1 = h
        .engine
        .submit(&project, "alice", "first take", vec![song_entry1.clone(), readme_entry1.clone()])
        .unwrap();
    h.engine.run_push(&push1.uid, &project).unwrap();
    let v1 = h.engine.get(&push1.uid).unwrap().version;

    // Resubmit the identical file list (fresh staging copies, same bytes).
    let song_entry2 = stage(&h.staging, "song2.flp.stage", &song);
    let readme_entry2 = stage(&h.staging, "readme2.txt.stage", b"hello world!");
    let resubmitted = vec![
        PushFileEntry {
            relative_path: "song.flp".into(),
            ..song_entry2
        },
        PushFileEntry {
            relative_path: "readme.txt".into(),
            ..readme_entry2
        },
    ];
    let push2 = h.engine.submit(&project, "alice", "again", resubmitted).unwrap();
    h.engine.run_push(&push2.uid, &project).unwrap();

    let done2 = h.engine.get(&push2.uid).unwrap();
    assert_eq!(done2.status, PushStatus::Done);
    assert_eq!(done2.version, v1, "second push must reference the existing version");
    assert_eq!(h.versions.count_completed(&project.id), 1, "no new version created");
    assert_eq!(h.blobs.ref_count(&song_entry1.hash), 1, "ref count unchanged by the no-op push");
}

/// S3 — modification: song.flp's content changes (same size), readme stays.
#[test]
fn s3_modification_creates_v2_and_keeps_v1s_blob_alive() {
    let h = harness("s3", 1_048_576, 10);
    let project = project(false);

    let song_v1 = vec![0xAAu8; 2_097_152];
    let song_entry1 = stage(&h.staging, "song.flp", &song_v1);
    let readme_entry1 = stage(&h.staging, "readme.txt", b"hello world!");
    let push1 = h
        .engine
        .submit(&project, "alice", "first take", vec![song_entry1.clone(), readme_entry1.clone()])
        .unwrap();
    h.engine.run_push(&push1.uid, &project).unwrap();

    let song_v2 = vec![0xBBu8; 2_097_152];
    let song_entry2_stage = stage(&h.staging, "song_v2.flp.stage", &song_v2);
    let readme_entry2_stage = stage(&h.staging, "readme2.txt.stage", b"hello world!");
    let push2_entries = vec![
        PushFileEntry {
            relative_path: "song.flp".into(),
            ..song_entry2_stage.clone()
        },
        PushFileEntry {
            relative_path: "readme.txt".into(),
            ..readme_entry2_stage
        },
    ];
    let push2 = h.engine.submit(&project, "alice", "new take", push2_entries).unwrap();
    h.engine.run_push(&push2.uid, &project).unwrap();

    let done2 = h.engine.get(&push2.uid).unwrap();
    assert_eq!(done2.status, PushStatus::Done);
    let v2 = h.versions.get(&done2.version).unwrap();
    assert_eq!(v2.version_number, Some(2));
    assert_eq!(v2.diff.files_added, 0);
    assert_eq!(v2.diff.files_modified, 1);
    assert_eq!(v2.diff.files_deleted, 0);
    assert_eq!(v2.diff.size_change, 0);

    // The old blob is still referenced by v1; the new blob is distinct.
    assert_ne!(song_entry1.hash, song_entry2_stage.hash);
    assert_eq!(h.blobs.ref_count(&song_entry1.hash), 1);
    assert_eq!(h.blobs.ref_count(&song_entry2_stage.hash), 1);
}

/// S4 — deleting v1 drops its exclusively-held blob but leaves v2's blob
/// and numbering untouched; the next version is numbered 3.
#[test]
fn s4_deleting_a_version_releases_its_blobs_without_renumbering() {
    let h = harness("s4", 1_048_576, 10);
    let project = project(false);

    let song_v1 = vec![0xAAu8; 2_097_152];
    let song_entry1 = stage(&h.staging, "song.flp", &song_v1);
    let readme_entry1 = stage(&h.staging, "readme.txt", b"hello world!");
    let push1 = h
        .engine
        .submit(&project, "alice", "first take", vec![song_entry1.clone(), readme_entry1.clone()])
        .unwrap();
    h.engine.run_push(&push1.uid, &project).unwrap();
    let v1 = h.engine.get(&push1.uid).unwrap().version;

    let song_v2 = vec![0xBBu8; 2_097_152];
    let song_entry2_stage = stage(&h.staging, "song_v2.flp.stage", &song_v2);
    let readme_entry2_stage = stage(&h.staging, "readme2.txt.stage", b"hello world!");
    let push2_entries = vec![
        PushFileEntry {
            relative_path: "song.flp".into(),
            ..song_entry2_stage.clone()
        },
        PushFileEntry {
            relative_path: "readme.txt".into(),
            ..readme_entry2_stage
        },
    ];
    let push2 = h.engine.submit(&project, "alice", "new take", push2_entries).unwrap();
    h.engine.run_push(&push2.uid, &project).unwrap();
    let v2 = h.engine.get(&push2.uid).unwrap().version;

    assert_eq!(h.blobs.ref_count(&song_entry1.hash), 1);
    h.versions.delete(&v1).unwrap();
    assert_eq!(h.blobs.ref_count(&song_entry1.hash), 0);
    assert!(!h.blobs.exists(&song_entry1.hash), "payload deleted once ref count hits zero");
    assert_eq!(h.blobs.ref_count(&song_entry2_stage.hash), 1, "v2's blob is untouched");

    let v2_after = h.versions.get(&v2).unwrap();
    assert_eq!(v2_after.version_number, Some(2), "survivors are never renumbered");

    let song_v3 = vec![0xCCu8; 2_097_152];
    let song_entry3_stage = stage(&h.staging, "song_v3.flp.stage", &song_v3);
    let readme_entry3_stage = stage(&h.staging, "readme3.txt.stage", b"hello world!");
    let push3_entries = vec![
        PushFileEntry {
            relative_path: "song.flp".into(),
            ..song_entry3_stage
        },
        PushFileEntry {
            relative_path: "readme.txt".into(),
            ..readme_entry3_stage
        },
    ];
    let push3 = h.engine.submit(&project, "alice", "third take", push3_entries).unwrap();
    h.engine.run_push(&push3.uid, &project).unwrap();
    let v3 = h.versions.get(&h.engine.get(&push3.uid).unwrap().version).unwrap();
    assert_eq!(v3.version_number, Some(3), "next completed version is numbered 3, not 2");
}

/// S5 — with `snapshot_interval=3`, the third completed version is a full
/// snapshot; the manifest ref is absent and no blob references are
/// attributed to it.
#[test]
fn s5_third_version_at_interval_three_is_a_snapshot() {
    let h = harness("s5", 1_048_576, 3);
    let project = project(false);

    for i in 0..3u8 {
        let content = vec![i; 10];
        let entry = stage(&h.staging, &format!("take_{i}.flp.stage"), &content);
        let entry = PushFileEntry {
            relative_path: "take.flp".into(),
            ..entry
        };
        let push = h
            .engine
            .submit(&project, "alice", format!("take {i}"), vec![entry])
            .unwrap();
        h.engine.run_push(&push.uid, &project).unwrap();
        assert_eq!(h.engine.get(&push.uid).unwrap().status, PushStatus::Done);
    }

    let versions = h.versions.list_completed(&project.id);
    assert_eq!(versions.len(), 3);
    let v1 = versions.iter().find(|v| v.version_number == Some(1)).unwrap();
    let v2 = versions.iter().find(|v| v.version_number == Some(2)).unwrap();
    let v3 = versions.iter().find(|v| v.version_number == Some(3)).unwrap();

    assert!(!v1.is_snapshot);
    assert!(!v2.is_snapshot);
    assert!(v3.is_snapshot, "the Nth completed version is a full snapshot");
    assert!(v3.manifest_ref.is_none());
    assert!(v3.snapshot_ref.is_some());
    assert!(h.store.exists(v3.snapshot_ref.as_ref().unwrap()));
}

/// S6 — a non-owner's push on an approval-gated project is held for
/// approval; the owner's rejection deletes the placeholder version and
/// registers no blobs.
#[test]
fn s6_rejecting_an_awaiting_push_deletes_placeholder_and_registers_no_blobs() {
    let h = harness("s6", 1_048_576, 10);
    let project = project(true);

    let big = vec![0xAAu8; 2_097_152];
    let entry = stage(&h.staging, "song.flp", &big);
    let push = h
        .engine
        .submit(&project, "bob", "bob's push", vec![entry.clone()])
        .unwrap();
    assert_eq!(push.status, PushStatus::AwaitingApproval);
    let placeholder = push.version.clone();
    assert!(h.versions.get(&placeholder).is_ok());

    let rejected = h.engine.reject(&push.uid, &project, "alice", "no").unwrap();
    assert_eq!(rejected.status, PushStatus::Rejected);
    assert_eq!(rejected.error_details.as_deref(), Some("no"));

    assert!(h.versions.get(&placeholder).is_err(), "placeholder version is gone");
    assert_eq!(h.blobs.ref_count(&entry.hash), 0, "no blob was ever acquired for a push never run");
    assert!(!h.blobs.exists(&entry.hash), "the worker never ran, so nothing was stored either");
    assert_eq!(h.versions.count_completed(&project.id), 0);
}
