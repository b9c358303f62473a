//! # but-next-vcs
//!
//! A thin CLI front-end over the push/version storage engine: exercises
//! `Engine` locally against a `LocalFileStore` rooted at the configured
//! `repo_root`, for demonstration and manual testing. A real deployment
//! wires `Engine` behind a network transport instead; this binary runs
//! everything — including what would otherwise be background worker
//! threads — inline, synchronously, on the calling thread.

use but_next_vcs::config::{self, AccessPolicy, Clock, OwnerOnlyAccessPolicy, ProjectContext, SystemClock, Task, TaskQueue};
use but_next_vcs::error::{EngineError, Result};
use but_next_vcs::file_store::LocalFileStore;
use but_next_vcs::hasher;
use but_next_vcs::ids::Uid;
use but_next_vcs::push::{ContentFetcher, LocalPathFetcher};
use but_next_vcs::version::{DownloadStatus, PushFileEntry, PushStatus};
use but_next_vcs::Engine;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// but-next-vcs — version-control backend for DAW project folders
#[derive(Parser, Debug)]
#[command(
    name = "but-next-vcs",
    version,
    about = "Push/version storage for DAW project folders: CAS dedup, manifest/snapshot versioning, restore 🎚",
    long_about = "but-next-vcs stores successive pushes of a project folder as versions: \
                  small files are deduplicated through content-addressed storage, every \
                  Nth version is a full archive snapshot, and identical pushes are detected \
                  and merged into the existing version rather than creating a new one."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project identifier
    #[arg(long, global = true, default_value = "default")]
    project: String,

    /// Project owner (only the owner can approve/reject/delete)
    #[arg(long, global = true, default_value_t = whoami_fallback())]
    owner: String,

    /// Acting user for this command
    #[arg(long, global = true, default_value_t = whoami_fallback())]
    actor: String,

    /// Require owner approval for pushes from non-owners
    #[arg(long, global = true)]
    requires_approval: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

fn whoami_fallback() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local-user".to_string())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new configuration file
    Init {
        #[arg(short, long, default_value = "but-next-vcs.toml")]
        output: PathBuf,
    },

    /// Push a directory as a new version
    Push {
        /// Directory to push
        source: PathBuf,

        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,

        /// Path to a newline-separated ignore-pattern file
        #[arg(long)]
        ignore_file: Option<PathBuf>,
    },

    /// Show a push's current status
    PushStatus { push_uid: String },

    /// Approve a push awaiting approval
    Approve { push_uid: String },

    /// Reject a push awaiting approval
    Reject {
        push_uid: String,
        #[arg(short, long, default_value = "rejected")]
        reason: String,
    },

    /// Cancel a non-terminal push
    Cancel { push_uid: String },

    /// List completed versions
    Versions {
        /// Include in-flight (pending/processing) versions
        #[arg(long)]
        include_processing: bool,
    },

    /// Show a version's detail, including its diff summary
    Show { version_uid: String },

    /// List a version's files (manifest-backed versions only)
    Files { version_uid: String },

    /// Restore a version into a target directory
    Restore {
        version_uid: String,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Request and build a download artifact, writing it to a file
    Download {
        version_uid: String,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete a completed version (owner only)
    DeleteVersion { version_uid: String },

    /// Run CAS and download-artifact garbage collection
    Sweep,
}

struct NoopQueue;
impl TaskQueue for NoopQueue {
    fn enqueue(&self, _task: Task) {}
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", colored::Colorize::red("error:"), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Init { output } => cmd_init(output),
        Command::Push {
            source,
            message,
            ignore_file,
        } => cmd_push(&cli, source, message, ignore_file.as_deref()),
        Command::PushStatus { push_uid } => cmd_push_status(&cli, push_uid),
        Command::Approve { push_uid } => cmd_approve(&cli, push_uid),
        Command::Reject { push_uid, reason } => cmd_reject(&cli, push_uid, reason),
        Command::Cancel { push_uid } => cmd_cancel(&cli, push_uid),
        Command::Versions { include_processing } => cmd_versions(&cli, *include_processing),
        Command::Show { version_uid } => cmd_show(&cli, version_uid),
        Command::Files { version_uid } => cmd_files(&cli, version_uid),
        Command::Restore { version_uid, output } => cmd_restore(&cli, version_uid, output),
        Command::Download { version_uid, output } => cmd_download(&cli, version_uid, output),
        Command::DeleteVersion { version_uid } => cmd_delete_version(&cli, version_uid),
        Command::Sweep => cmd_sweep(&cli),
    }
}

// ─── Setup ───────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<config::EngineConfig> {
    if let Some(path) = &cli.config {
        config::load_config_from(path)
    } else {
        config::load_config()
    }
}

fn build_engine(cli: &Cli) -> Result<Engine> {
    let cfg = load_config(cli)?;
    let file_store = Arc::new(LocalFileStore::new(cfg.repo_root.clone()));
    let fetcher: Arc<dyn ContentFetcher> = Arc::new(LocalPathFetcher);
    Engine::new(
        file_store,
        cfg,
        Arc::new(OwnerOnlyAccessPolicy) as Arc<dyn AccessPolicy>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        Arc::new(NoopQueue) as Arc<dyn TaskQueue>,
        fetcher,
    )
}

fn project_context(cli: &Cli, ignore_file: Option<&Path>) -> Result<ProjectContext> {
    let ignore_patterns = match ignore_file {
        Some(path) if path.exists() => std::fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    Ok(ProjectContext {
        id: cli.project.clone(),
        owner: cli.owner.clone(),
        requires_approval: cli.requires_approval,
        ignore_patterns,
    })
}

fn parse_uid(raw: &str) -> Uid {
    Uid::from(raw.to_string())
}

// ─── Commands ────────────────────────────────────────────────────────────

fn cmd_init(output: &Path) -> Result<()> {
    config::init_config(output)?;
    eprintln!(
        "{} Created configuration file: {}",
        colored::Colorize::green("✓"),
        output.display(),
    );
    Ok(())
}

fn cmd_push(cli: &Cli, source: &Path, message: &str, ignore_file: Option<&Path>) -> Result<()> {
    let engine = build_engine(cli)?;
    let project = project_context(cli, ignore_file)?;

    print_header("Push");
    let file_list = collect_file_list(source)?;
    eprintln!("  Source:  {}", source.display());
    eprintln!("  Files:   {}", file_list.len());

    let push = engine.submit_push(&project, &cli.actor, message, file_list)?;
    eprintln!("  Push:    {} ({:?})", push.uid, push.status);

    match push.status {
        PushStatus::AwaitingApproval => {
            eprintln!(
                "  {} awaiting approval from the project owner ({})",
                colored::Colorize::yellow("…"),
                project.owner
            );
            return Ok(());
        }
        PushStatus::Pending => {
            engine.run_push(&push.uid, &project)?;
        }
        _ => {}
    }

    let done = engine.get_push(&push.uid)?;
    print_push_status(&done);
    Ok(())
}

fn cmd_push_status(cli: &Cli, push_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let push = engine.get_push(&parse_uid(push_uid))?;
    print_push_status(&push);
    Ok(())
}

fn cmd_approve(cli: &Cli, push_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let project = project_context(cli, None)?;
    let uid = parse_uid(push_uid);
    let push = engine.approve_push(&uid, &project, &cli.actor)?;
    eprintln!("{} push {} approved, running", colored::Colorize::green("✓"), push.uid);
    engine.run_push(&uid, &project)?;
    print_push_status(&engine.get_push(&uid)?);
    Ok(())
}

fn cmd_reject(cli: &Cli, push_uid: &str, reason: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let project = project_context(cli, None)?;
    let push = engine.reject_push(&parse_uid(push_uid), &project, &cli.actor, reason)?;
    eprintln!("{} push {} rejected: {reason}", colored::Colorize::red("✗"), push.uid);
    Ok(())
}

fn cmd_cancel(cli: &Cli, push_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let project = project_context(cli, None)?;
    let push = engine.cancel_push(&parse_uid(push_uid), &project, &cli.actor)?;
    eprintln!("{} push {} cancelled", colored::Colorize::yellow("…"), push.uid);
    Ok(())
}

fn cmd_versions(cli: &Cli, include_processing: bool) -> Result<()> {
    let engine = build_engine(cli)?;
    let versions = engine.list_versions(&cli.project, include_processing);

    if versions.is_empty() {
        eprintln!("No versions found.");
        return Ok(());
    }

    eprintln!(
        "{:>4}  {:18}  {:9}  {:>8}  {:>10}  {}",
        "#", "Uid", "Status", "Files", "Size", "Message"
    );
    eprintln!("{}", "─".repeat(80));
    for v in &versions {
        eprintln!(
            "{:>4}  {:18}  {:9}  {:>8}  {:>10}  {}",
            v.version_number.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            v.uid,
            format!("{:?}", v.status).to_lowercase(),
            v.file_count,
            format_size(v.file_size),
            v.commit_message,
        );
    }
    Ok(())
}

fn cmd_show(cli: &Cli, version_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let v = engine.get_version(&parse_uid(version_uid))?;

    eprintln!("  Uid:       {}", v.uid);
    eprintln!("  Version:   {}", v.version_number.map(|n| n.to_string()).unwrap_or_else(|| "-".into()));
    eprintln!("  Status:    {:?}", v.status);
    eprintln!("  Storage:   {}", if v.is_snapshot { "snapshot" } else { "manifest + cas" });
    eprintln!("  Files:     {}", v.file_count);
    eprintln!("  Size:      {}", format_size(v.file_size));
    eprintln!("  Message:   {}", v.commit_message);
    eprintln!();
    eprintln!(
        "  Diff: +{} ~{} -{} ({}{})",
        v.diff.files_added,
        v.diff.files_modified,
        v.diff.files_deleted,
        if v.diff.size_change >= 0 { "+" } else { "" },
        format_signed_size(v.diff.size_change),
    );
    if let Some(reason) = &v.failure_reason {
        eprintln!("  Failure:   {reason}");
    }
    Ok(())
}

fn cmd_files(cli: &Cli, version_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let files = engine.list_files(&parse_uid(version_uid))?;
    for f in &files {
        eprintln!("  {:>10}  {}  {}", format_size(f.size), &f.hash[..12.min(f.hash.len())], f.path);
    }
    eprintln!();
    eprintln!("  {} file(s)", files.len());
    Ok(())
}

fn cmd_restore(cli: &Cli, version_uid: &str, output: &Path) -> Result<()> {
    let engine = build_engine(cli)?;
    let stats = engine.restore_version(&parse_uid(version_uid), output)?;
    eprintln!(
        "{} Restored {} files ({}) into {}",
        colored::Colorize::green("✓"),
        stats.files_restored,
        format_size(stats.total_size),
        output.display(),
    );
    if !stats.errors.is_empty() {
        eprintln!("  {} file(s) failed to restore:", stats.errors.len());
        for e in &stats.errors {
            eprintln!("    {} — {}", e.path, e.message);
        }
    }
    Ok(())
}

fn cmd_download(cli: &Cli, version_uid: &str, output: &Path) -> Result<()> {
    let engine = build_engine(cli)?;
    let version_uid = parse_uid(version_uid);
    let req = engine.request_download(&version_uid, &cli.actor)?;
    if req.status == DownloadStatus::Pending {
        engine.build_download(&req.uid)?;
    }
    let mut artifact = engine.fetch_artifact(&req.uid)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(output)?;
    std::io::copy(&mut artifact, &mut out)?;
    eprintln!("{} Wrote download artifact to {}", colored::Colorize::green("✓"), output.display());
    Ok(())
}

fn cmd_delete_version(cli: &Cli, version_uid: &str) -> Result<()> {
    let engine = build_engine(cli)?;
    let project = project_context(cli, None)?;
    engine.delete_version(&parse_uid(version_uid), &project, &cli.actor)?;
    eprintln!("{} version deleted", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_sweep(cli: &Cli) -> Result<()> {
    let engine = build_engine(cli)?;
    let blobs = engine.sweep_blobs()?;
    let downloads = engine.sweep_downloads()?;
    eprintln!(
        "{} Swept {} unreferenced blob(s), expired {} download(s)",
        colored::Colorize::green("✓"),
        blobs,
        downloads,
    );
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────

fn collect_file_list(source: &Path) -> Result<Vec<PushFileEntry>> {
    if !source.is_dir() {
        return Err(EngineError::not_found(format!("not a directory: {}", source.display())));
    }
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let hash = hasher::hash_file(entry.path())?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(PushFileEntry {
            relative_path: relative,
            hash,
            size: Some(size),
            local_path: Some(entry.path().to_string_lossy().to_string()),
        });
    }
    Ok(entries)
}

fn print_push_status(push: &but_next_vcs::version::Push) {
    eprintln!("  Status:    {:?}", push.status);
    eprintln!("  Progress:  {}%", push.progress);
    eprintln!("  Message:   {}", push.message);
    eprintln!("  Version:   {}", push.version);
    if let Some(err) = &push.error_details {
        eprintln!("  Error:     {err}");
    }
}

fn print_header(action: &str) {
    eprintln!();
    eprintln!(
        "  {} but-next-vcs v{} — {action}",
        colored::Colorize::bold("⚡"),
        env!("CARGO_PKG_VERSION"),
    );
    eprintln!();
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}

fn format_signed_size(delta: i64) -> String {
    format_size(delta.unsigned_abs())
}
