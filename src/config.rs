//! # Configuration & Injected Collaborators
//!
//! Handles loading, parsing, and validation of the engine's TOML
//! configuration file, the way the teacher crate's `config.rs` loads its
//! own settings file — a prioritized search path, a `serde`/`toml`
//! round-trip, then a validation pass before the config reaches callers.
//!
//! This module also defines the trait boundaries for everything the core
//! depends on but does not own: identity/authorization (`AccessPolicy`),
//! time (`Clock`), and background execution (`TaskQueue`). None of these
//! are implemented with real infrastructure here — the engine is a library
//! a transport layer embeds, and that layer supplies the real
//! implementations. What ships here are the trait contracts plus minimal
//! concrete implementations (`SystemClock`, `ThreadPoolQueue`) sufficient to
//! run the CLI harness and the test suite.

use crate::error::{ConfigError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::{env, fs};

/// Tunables recognized by the engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Files larger than this go to CAS; smaller are inlined into the
    /// manifest as base64.
    #[serde(default = "default_cas_threshold_bytes")]
    pub cas_threshold_bytes: u64,

    /// Every Nth completed version is stored as a full snapshot archive
    /// instead of a manifest + CAS references.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// How long a completed download artifact remains fetchable.
    #[serde(default = "default_download_expiration_hours")]
    pub download_expiration_hours: i64,

    /// Interval between blob-store GC sweeps, for a caller-owned scheduler.
    #[serde(default = "default_blob_sweep_interval_minutes")]
    pub blob_sweep_interval_minutes: u64,

    /// Cap on the number of entries kept in each change-detail bucket.
    #[serde(default = "default_max_change_detail_entries")]
    pub max_change_detail_entries: usize,

    /// Root directory for the local `FileStore` backing this engine
    /// instance.
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
}

fn default_cas_threshold_bytes() -> u64 {
    1024 * 1024
}
fn default_snapshot_interval() -> u64 {
    10
}
fn default_download_expiration_hours() -> i64 {
    1
}
fn default_blob_sweep_interval_minutes() -> u64 {
    60
}
fn default_max_change_detail_entries() -> usize {
    50
}
fn default_repo_root() -> PathBuf {
    PathBuf::from(".but-next-vcs")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_threshold_bytes: default_cas_threshold_bytes(),
            snapshot_interval: default_snapshot_interval(),
            download_expiration_hours: default_download_expiration_hours(),
            blob_sweep_interval_minutes: default_blob_sweep_interval_minutes(),
            max_change_detail_entries: default_max_change_detail_entries(),
            repo_root: default_repo_root(),
        }
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/but-next-vcs.toml")];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/but-next-vcs.toml")));
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/but-next-vcs.toml")));
    }
    paths.push(PathBuf::from("but-next-vcs.toml"));
    paths
}

/// Loads configuration from the first found config file in the search
/// path, falling back to defaults if none exists.
pub fn load_config() -> Result<EngineConfig> {
    for path in &config_search_paths() {
        if path.exists() {
            return load_config_from(path);
        }
    }
    Ok(EngineConfig::default())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<EngineConfig> {
    let content = fs::read_to_string(path)?;
    let config: EngineConfig =
        toml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &EngineConfig) -> std::result::Result<(), ConfigError> {
    if config.cas_threshold_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "cas_threshold_bytes must be greater than 0".to_string(),
        });
    }
    if config.snapshot_interval == 0 {
        return Err(ConfigError::Validation {
            message: "snapshot_interval must be greater than 0".to_string(),
        });
    }
    if config.download_expiration_hours <= 0 {
        return Err(ConfigError::Validation {
            message: "download_expiration_hours must be greater than 0".to_string(),
        });
    }
    Ok(())
}

/// Writes a default configuration file at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ConfigError::Validation {
            message: format!("config file already exists: {}", path.display()),
        }
        .into());
    }
    let config = EngineConfig::default();
    let toml_str = toml::to_string_pretty(&config)
        .map_err(|e| crate::error::EngineError::internal(format!("serializing config: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml_str)?;
    Ok(())
}

// ─── Injected collaborators ─────────────────────────────────────────────────

/// Minimal, externally-owned project context the engine needs on every
/// call. Real project CRUD, membership, and team roles live outside this
/// crate; the caller resolves them and passes the handful of facts the
/// push/version engine actually consumes.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub id: String,
    pub owner: String,
    pub requires_approval: bool,
    pub ignore_patterns: Vec<String>,
}

/// Evaluates capability checks the engine must respect but does not own.
pub trait AccessPolicy: Send + Sync {
    fn can_edit(&self, project: &ProjectContext, user: &str) -> bool;
    fn can_view(&self, project: &ProjectContext, user: &str) -> bool;
    fn is_owner(&self, project: &ProjectContext, user: &str) -> bool {
        project.owner == user
    }
}

/// The obvious access policy: owners can do everything; anyone else can
/// view but not edit. A real deployment wires in team roles; this is the
/// stand-in the CLI and tests use.
pub struct OwnerOnlyAccessPolicy;

impl AccessPolicy for OwnerOnlyAccessPolicy {
    fn can_edit(&self, project: &ProjectContext, user: &str) -> bool {
        project.owner == user
    }
    fn can_view(&self, _project: &ProjectContext, _user: &str) -> bool {
        true
    }
}

/// Injected wall clock, so version numbering and download expiry can be
/// tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A unit of background work the engine hands off after a state
/// transition — e.g. "run this push" or "build this download artifact."
/// The queue is at-least-once; handlers must be idempotent given the
/// push/download uid, which `PushEngine`/`DownloadEngine` already are
/// (re-running a push that already finished is a cheap no-op check).
#[derive(Debug, Clone)]
pub enum Task {
    RunPush { push_uid: crate::ids::Uid },
    BuildDownload { download_uid: crate::ids::Uid },
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: Task);
}

/// A small fixed worker pool over `std::thread`, the synchronous
/// counterpart to the teacher's blocking I/O style — no async runtime, in
/// keeping with a dependency stack that never added one.
pub struct ThreadPoolQueue {
    sender: mpsc::Sender<Task>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPoolQueue {
    /// Spawns `worker_count` threads, each pulling tasks from a shared
    /// channel and invoking `handler` for each one.
    pub fn new<F>(worker_count: usize, handler: F) -> Self
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(parking_lot::Mutex::new(receiver));
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            workers.push(std::thread::spawn(move || loop {
                let task = {
                    let rx = receiver.lock();
                    rx.recv()
                };
                match task {
                    Ok(task) => handler(task),
                    Err(_) => break, // sender dropped, channel closed
                }
            }));
        }

        Self {
            sender,
            _workers: workers,
        }
    }
}

impl TaskQueue for ThreadPoolQueue {
    fn enqueue(&self, task: Task) {
        // If every worker has already exited (e.g. during shutdown), the
        // send fails; there is nowhere useful to report that from a
        // fire-and-forget queue, so the task is simply dropped.
        let _ = self.sender.send(task);
    }
}
