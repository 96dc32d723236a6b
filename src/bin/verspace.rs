//! # Verspace CLI - version history for your files
//!
//! Command-line interface for the Verspace library.
//!
//! ## Usage
//! ```bash
//! # Start tracking the current directory
//! verspace init
//!
//! # Capture a file and list its history
//! verspace capture notes.md -m "before rewrite"
//! verspace log notes.md
//!
//! # Compare and restore
//! verspace diff notes.md 3f2a
//! verspace restore notes.md 3f2a
//!
//! # Whole-space versions
//! verspace snapshot -m "release"
//! verspace restore-space 91cc
//!
//! # Capture changes automatically for ten minutes
//! verspace watch --seconds 600
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use verspace::{
    default_exclude_patterns, format_bytes, DiffKind, DiffOptions, LineChange, MonitorEvent,
    PolicyOutcome, Result, Space, StoragePolicy, VersionError, VersionKeeper,
};

/// Verspace CLI - per-file version history for directories
#[derive(Parser)]
#[command(name = "verspace")]
#[command(version)]
#[command(about = "Capture, compare and restore versions of the files in a directory")]
#[command(long_about = None)]
struct Cli {
    /// Space directory (defaults to the current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking a directory
    Init {
        /// Additional exclude patterns (glob)
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Capture the current content of a file
    #[command(alias = "c")]
    Capture {
        /// File to capture
        file: PathBuf,

        /// Comment stored with the version
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List versions of a file
    #[command(alias = "ls")]
    Log {
        /// File whose history to show
        file: PathBuf,

        /// Show at most this many versions
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the content of a version
    Show {
        /// File the version belongs to
        file: PathBuf,

        /// Version id or unique prefix
        version: String,
    },

    /// Compare a version with another version or the live file
    Diff {
        /// File the versions belong to
        file: PathBuf,

        /// Older version id or prefix
        from: String,

        /// Newer version id or prefix (defaults to the live file)
        to: Option<String>,

        /// Context lines around changes
        #[arg(short = 'U', long, default_value_t = 3)]
        context: usize,

        /// Ignore leading and trailing whitespace
        #[arg(short = 'w', long)]
        ignore_whitespace: bool,
    },

    /// Restore a file to a version
    #[command(alias = "rs")]
    Restore {
        /// File to restore
        file: PathBuf,

        /// Version id or unique prefix
        version: String,

        /// Comment for the safety version of the current content
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Copy the whole space into a space version
    Snapshot {
        /// Comment stored with the space version
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List space versions
    Snapshots,

    /// Restore the whole space to a space version
    RestoreSpace {
        /// Space version id or unique prefix
        version: String,
    },

    /// Show storage usage
    Usage,

    /// Apply a retention policy (the configured one by default)
    Enforce {
        /// Bound the control directory to this many bytes
        #[arg(long, group = "policy")]
        max_size: Option<u64>,

        /// Delete versions older than this many days
        #[arg(long, group = "policy")]
        max_age: Option<u32>,

        /// Keep at most this many file versions
        #[arg(long, group = "policy")]
        max_versions: Option<usize>,

        /// Warning threshold as a fraction of the limit
        #[arg(long)]
        warn: Option<f64>,
    },

    /// Capture changed files automatically
    Watch {
        /// Stop after this many seconds
        #[arg(long, default_value_t = 60)]
        seconds: u64,

        /// Apply the configured retention policy every this many seconds
        #[arg(long)]
        retention_every: Option<u64>,
    },

    /// Stop tracking and delete all version data
    Untrack {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        if e.is_rollback_failure() {
            eprintln!("{}", "Live data may be inconsistent; inspect the preserved backup.".red());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init { exclude } => cmd_init(&root, exclude),
        Commands::Capture { file, message } => cmd_capture(&file, message),
        Commands::Log { file, limit } => cmd_log(&file, limit),
        Commands::Show { file, version } => cmd_show(&file, &version),
        Commands::Diff { file, from, to, context, ignore_whitespace } => {
            cmd_diff(&file, &from, to.as_deref(), context, ignore_whitespace)
        }
        Commands::Restore { file, version, message } => cmd_restore(&file, &version, message),
        Commands::Snapshot { message } => cmd_snapshot(&root, message),
        Commands::Snapshots => cmd_snapshots(&root),
        Commands::RestoreSpace { version } => cmd_restore_space(&root, &version),
        Commands::Usage => cmd_usage(&root),
        Commands::Enforce { max_size, max_age, max_versions, warn } => {
            cmd_enforce(&root, max_size, max_age, max_versions, warn)
        }
        Commands::Watch { seconds, retention_every } => cmd_watch(&root, seconds, retention_every),
        Commands::Untrack { yes } => cmd_untrack(&root, yes),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn open(keeper: &VersionKeeper, path: &Path) -> Result<Space> {
    keeper.find_space(path)
}

fn cmd_init(root: &Path, exclude: Vec<String>) -> Result<()> {
    let mut patterns = default_exclude_patterns();
    patterns.extend(exclude);
    let keeper = VersionKeeper::builder().exclude_patterns(patterns).build()?;
    let space = keeper.create_space(root)?;

    println!("{} Tracking {}", "✓".green().bold(), space.root().display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Capture a file: {}", "verspace capture <file> -m \"first draft\"".yellow());
    println!("  - Watch for changes: {}", "verspace watch".yellow());
    Ok(())
}

fn cmd_capture(file: &Path, message: Option<String>) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, file)?;
    let version = keeper.capture(&space, file, message)?;

    println!(
        "{} Captured {} as {}",
        "✓".green().bold(),
        version.file_path.display(),
        version.short_id().yellow().bold()
    );
    println!("  Size: {}", format_bytes(version.size).cyan());
    println!("  Hash: {}", version.content_hash[..16].dimmed());
    Ok(())
}

fn cmd_log(file: &Path, limit: Option<usize>) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, file)?;
    let versions = keeper.list_versions(&space, file)?;

    if versions.is_empty() {
        println!("{}", "No versions yet".dimmed());
        return Ok(());
    }

    let now = chrono::Utc::now();
    let shown = limit.unwrap_or(versions.len());
    for version in versions.iter().take(shown) {
        let age = version.age(now).to_std().unwrap_or_default();
        let age = Duration::from_secs(age.as_secs());
        println!(
            "{}  {}  {:>10}  {}",
            version.short_id().yellow(),
            version.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().cyan(),
            format_bytes(version.size),
            format!("{} ago", format_duration(age)).dimmed()
        );
        if let Some(comment) = &version.comment {
            println!("          {}", comment);
        }
    }
    if versions.len() > shown {
        println!("{}", format!("... {} more", versions.len() - shown).dimmed());
    }
    Ok(())
}

fn cmd_show(file: &Path, id: &str) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, file)?;
    let version = keeper.find_version(&space, file, id)?;
    let bytes = keeper.read(&version)?;
    std::io::stdout().write_all(&bytes)?;
    Ok(())
}

fn cmd_diff(file: &Path, from: &str, to: Option<&str>, context: usize, ignore_whitespace: bool) -> Result<()> {
    let keeper = VersionKeeper::builder()
        .diff_options(DiffOptions {
            context_lines: context,
            ignore_whitespace,
            ..Default::default()
        })
        .build()?;
    let space = open(&keeper, file)?;
    let diff = match to {
        Some(to) => keeper.diff_versions(&space, file, from, to)?,
        None => keeper.diff_with_current(&space, file, from)?,
    };

    match diff.kind {
        DiffKind::Identical => println!("{}", "Identical".green()),
        DiffKind::Binary => println!("{}", "Binary content differs".yellow()),
        DiffKind::Text => {
            for hunk in &diff.hunks {
                println!(
                    "{}",
                    format!(
                        "@@ -{},{} +{},{} @@",
                        hunk.from_line, hunk.from_count, hunk.to_line, hunk.to_count
                    )
                    .cyan()
                );
                for change in &hunk.changes {
                    match change {
                        LineChange::Added(_, line) => println!("{}", format!("+{}", line).green()),
                        LineChange::Deleted(_, line) => println!("{}", format!("-{}", line).red()),
                        LineChange::Context(_, line) => println!(" {}", line),
                    }
                }
            }
            println!(
                "\n{} {}",
                format!("+{}", diff.lines_added).green(),
                format!("-{}", diff.lines_deleted).red()
            );
        }
    }
    Ok(())
}

fn cmd_restore(file: &Path, id: &str, message: Option<String>) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, file)?;

    let pb = spinner("Restoring...");
    let result = keeper.restore(&space, file, id, message);
    pb.finish_and_clear();
    let result = result?;

    println!(
        "{} Restored {} to {}",
        "✓".green().bold(),
        result.file_path.display(),
        result.version_id.to_string()[..8].yellow().bold()
    );
    if let Some(backup) = &result.backup_version {
        println!("  Safety version: {}", backup.short_id().cyan());
    }
    println!("  Written: {}", format_bytes(result.bytes_written).cyan());
    println!("  Time: {}", format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan());
    Ok(())
}

fn cmd_snapshot(root: &Path, message: Option<String>) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;

    let start = Instant::now();
    let pb = spinner("Copying space...");
    let version = keeper.snapshot_space(&space, message);
    pb.finish_and_clear();
    let version = version?;

    println!("{} Created space version {}", "✓".green().bold(), version.short_id().yellow().bold());
    println!("  Files: {}", version.file_count.to_string().cyan());
    println!("  Size: {}", format_bytes(version.total_size).cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

fn cmd_snapshots(root: &Path) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;
    let versions = keeper.list_space_versions(&space)?;

    if versions.is_empty() {
        println!("{}", "No space versions yet".dimmed());
    }
    for version in versions {
        println!(
            "{}  {}  {:>6} files  {:>10}  {}",
            version.short_id().yellow(),
            version.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().cyan(),
            version.file_count,
            format_bytes(version.total_size),
            version.comment.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_restore_space(root: &Path, id: &str) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;

    let pb = spinner("Restoring space...");
    let result = keeper.restore_space(&space, id);
    pb.finish_and_clear();
    let result = result?;

    println!(
        "{} Restored space to {}",
        "✓".green().bold(),
        result.version_id.to_string()[..8].yellow().bold()
    );
    println!("  Items restored: {}", result.items_restored.to_string().cyan());
    println!("  Items removed: {}", result.items_removed.to_string().cyan());
    println!("  Safety version: {}", result.backup_version.short_id().cyan());
    println!("  Time: {}", format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan());
    Ok(())
}

fn cmd_usage(root: &Path) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;
    let usage = keeper.usage(&space)?;

    println!("{}", "Storage usage".bold());
    println!("  Space: {}", usage.space_path.display().to_string().cyan());
    println!("  Files: {}", format_bytes(usage.original_bytes).cyan());
    println!("  Versions: {} ({})", usage.version_count.to_string().cyan(), format_bytes(usage.control_bytes).cyan());
    println!("  Ratio: {:.2}", usage.utilization);
    if let (Some(oldest), Some(newest)) = (usage.oldest, usage.newest) {
        println!("  Oldest: {}", oldest.format("%Y-%m-%d %H:%M:%S"));
        println!("  Newest: {}", newest.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn cmd_enforce(
    root: &Path,
    max_size: Option<u64>,
    max_age: Option<u32>,
    max_versions: Option<usize>,
    warn: Option<f64>,
) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;

    let mut policy = match (max_size, max_age, max_versions) {
        (Some(bytes), _, _) => StoragePolicy::max_size(bytes),
        (_, Some(days), _) => StoragePolicy::max_age(days),
        (_, _, Some(count)) => StoragePolicy::max_versions(count),
        _ => space.config().storage_policy,
    };
    if let Some(threshold) = warn {
        policy = policy.with_warning_threshold(threshold);
    }

    match keeper.enforce(&space, &policy)? {
        PolicyOutcome::Compliant(msg) => println!("{} {}", "✓".green().bold(), msg),
        PolicyOutcome::Warning(msg) => println!("{} {}", "!".yellow().bold(), msg.yellow()),
        PolicyOutcome::Enforced(report) => {
            println!("{} {}", "✓".green().bold(), report.summary());
            for error in &report.errors {
                println!("  {}", error.red());
            }
        }
        PolicyOutcome::Skipped(msg) => println!("{}", msg.dimmed()),
    }
    Ok(())
}

fn cmd_watch(root: &Path, seconds: u64, retention_every: Option<u64>) -> Result<()> {
    let keeper = VersionKeeper::new();
    let space = open(&keeper, root)?;

    let printer = Arc::new(|event: MonitorEvent| {
        let tag = if event.synthetic { " (scan)" } else { "" };
        println!("{} {:?} {}{}", "•".cyan(), event.kind, event.path.display(), tag.dimmed());
    });
    keeper.start_monitoring(&space, printer)?;
    println!(
        "{} Watching {} ({:?}) for {}",
        "✓".green().bold(),
        space.root().display().to_string().cyan(),
        keeper.monitor_state(&space),
        format_duration(Duration::from_secs(seconds))
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let retention = retention_every.map(|secs| keeper.spawn_retention(&space, Duration::from_secs(secs)));
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        if let Some(handle) = retention {
            handle.abort();
        }
    });

    keeper.stop_monitoring(&space);
    if let Some(stats) = keeper.monitor_stats(&space) {
        println!(
            "\n{}",
            format!(
                "{} events, {} captures, {} throttled, {} failed",
                stats.events_received, stats.captures_completed, stats.events_throttled, stats.captures_failed
            )
            .dimmed()
        );
    }
    Ok(())
}

fn cmd_untrack(root: &Path, yes: bool) -> Result<()> {
    if !yes {
        return Err(VersionError::InvalidConfiguration(
            "untrack deletes all version data; pass --yes to confirm".to_string(),
        ));
    }
    let keeper = VersionKeeper::new();
    let space = keeper.open_space(root)?;
    let path = space.root().to_path_buf();
    keeper.remove_space(space)?;
    println!("{} Stopped tracking {}", "✓".green().bold(), path.display().to_string().cyan());
    Ok(())
}
