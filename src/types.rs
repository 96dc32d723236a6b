//! Core data types used throughout the verspace library
//!
//! This module contains the data structures shared between the store, the
//! restore coordinator, the change monitor and the retention enforcer.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Versions**: `FileVersion`, `SpaceVersion` - immutable records of captured content
//! - **Configuration**: `SpaceConfig`, `StoragePolicy`, `MonitorConfig` - per-space settings
//! - **Operations**: `RestoreResult`, `SpaceRestoreResult`, `CleanupReport` - results of operations
//! - **Monitoring**: `ChangeKind`, `MonitorEvent`, `MonitorState` - change notification
//! - **Diffing**: `VersionDiff`, `DiffHunk`, `LineChange`, `DiffOptions`
//!
//! ## Examples
//!
//! ```rust
//! use verspace::types::StoragePolicy;
//!
//! // Keep at most 20 versions, warn at 75% of that
//! let policy = StoragePolicy::max_versions(20).with_warning_threshold(0.75);
//! assert!(policy.validate().is_ok());
//! ```

use crate::error::{Result, VersionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Current on-disk format version of `metadata.json`
pub const FORMAT_VERSION: u32 = 1;

/// Immutable record of one captured version of a file
///
/// Serialized as one JSON object per version under
/// `.control/file_metadata/<pathHash>/<id>.json`. The blob at
/// `storage_path` always hashes to `content_hash`.
///
/// # Examples
///
/// ```rust
/// # use verspace::types::FileVersion;
/// # use std::path::PathBuf;
/// # use chrono::Utc;
/// # use uuid::Uuid;
/// let version = FileVersion {
///     id: Uuid::new_v4(),
///     file_path: PathBuf::from("/work/notes.txt"),
///     timestamp: Utc::now(),
///     size: 10,
///     comment: Some("before refactor".to_string()),
///     content_hash: "ab12...".to_string(),
///     storage_path: PathBuf::from("/work/.control/file_versions/ff00/x.blob"),
/// };
/// assert_eq!(version.short_id().len(), 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    /// Globally unique identifier
    pub id: Uuid,
    /// Absolute path of the source file
    pub file_path: PathBuf,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Size of the captured bytes
    pub size: u64,
    /// Optional free-text comment
    pub comment: Option<String>,
    /// Hex-encoded SHA-256 of the captured bytes
    pub content_hash: String,
    /// Absolute path of the blob
    pub storage_path: PathBuf,
}

impl FileVersion {
    /// First eight characters of the identifier, for display
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    /// Age of this version relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Whole-space version used by space restore
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceVersion {
    /// Globally unique identifier
    pub id: Uuid,
    /// Root of the space this snapshot was taken from
    pub space_path: PathBuf,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Optional free-text comment
    pub comment: Option<String>,
    /// Directory holding the copied tree
    pub storage_path: PathBuf,
    /// Number of regular files copied
    pub file_count: usize,
    /// Total bytes copied
    pub total_size: u64,
}

impl SpaceVersion {
    /// First eight characters of the identifier, for display
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// What a storage policy bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "limit", rename_all = "camelCase")]
pub enum PolicyKind {
    /// Maximum bytes held by the control directory
    MaxSize(u64),
    /// Maximum version age in days
    MaxAge(u32),
    /// Maximum number of file versions in the space
    MaxVersions(usize),
}

/// Per-space retention rule
///
/// # Examples
///
/// ```rust
/// # use verspace::types::{StoragePolicy, PolicyKind};
/// let policy = StoragePolicy::default();
/// assert_eq!(policy.kind, PolicyKind::MaxSize(10 * 1024 * 1024 * 1024));
/// assert!(policy.enabled);
/// assert_eq!(policy.warning_threshold, 0.8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoragePolicy {
    /// What is bounded and the limit
    pub kind: PolicyKind,
    /// Disabled policies are reported as skipped
    pub enabled: bool,
    /// Fraction of the limit at which a soft warning fires
    pub warning_threshold: f64,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            kind: PolicyKind::MaxSize(10 * 1024 * 1024 * 1024),
            enabled: true,
            warning_threshold: 0.8,
        }
    }
}

impl StoragePolicy {
    /// Bound the control directory to `bytes`
    pub fn max_size(bytes: u64) -> Self {
        Self { kind: PolicyKind::MaxSize(bytes), ..Default::default() }
    }

    /// Drop versions older than `days`
    pub fn max_age(days: u32) -> Self {
        Self { kind: PolicyKind::MaxAge(days), ..Default::default() }
    }

    /// Keep at most `count` file versions across the space
    pub fn max_versions(count: usize) -> Self {
        Self { kind: PolicyKind::MaxVersions(count), ..Default::default() }
    }

    /// Set the warning threshold fraction
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Turn the policy off
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject thresholds outside 0.0..=1.0 and zero limits
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(VersionError::InvalidConfiguration(format!(
                "warning threshold {} is outside 0.0..=1.0",
                self.warning_threshold
            )));
        }
        let zero = match self.kind {
            PolicyKind::MaxSize(bytes) => bytes == 0,
            PolicyKind::MaxAge(days) => days == 0,
            PolicyKind::MaxVersions(count) => count == 0,
        };
        if zero {
            return Err(VersionError::InvalidConfiguration(
                "policy limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper storing a `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Timing knobs for the change monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Minimum interval between automatic captures of one path
    #[serde(with = "duration_ms")]
    pub throttle_window: Duration,
    /// Age after which a throttle entry is dropped
    #[serde(with = "duration_ms")]
    pub throttle_expiry: Duration,
    /// Fallback scanner period
    #[serde(with = "duration_ms")]
    pub scan_interval: Duration,
    /// Fallback scanner treats files modified within this window as changed
    #[serde(with = "duration_ms")]
    pub recent_window: Duration,
    /// Prune the throttle map every this many inserts
    pub prune_every: usize,
    /// Prune the throttle map when it holds more entries than this
    pub prune_ceiling: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            throttle_window: Duration::from_secs(5),
            throttle_expiry: Duration::from_secs(300),
            scan_interval: Duration::from_secs(2),
            recent_window: Duration::from_secs(10),
            prune_every: 20,
            prune_ceiling: 1000,
        }
    }
}

/// Default exclude patterns for tracked names
pub fn default_exclude_patterns() -> Vec<String> {
    ["*.tmp", "*.temp", "~$*", ".DS_Store", "Thumbs.db"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Configuration persisted with each space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Retention rule
    pub storage_policy: StoragePolicy,
    /// Glob patterns for names that are never captured
    pub exclude_patterns: Vec<String>,
    /// Change monitor timing
    pub monitor: MonitorConfig,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            storage_policy: StoragePolicy::default(),
            exclude_patterns: default_exclude_patterns(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Contents of `.control/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceMetadata {
    /// Version of the on-disk format
    pub format_version: u32,
    /// Crate version that created the space
    pub crate_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last time the space was opened
    pub last_accessed: DateTime<Utc>,
    /// Space configuration
    pub config: SpaceConfig,
}

/// Steps of a single-file restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePhase {
    /// Checking the version against the path
    Validating,
    /// Capturing the live file as a safety version
    BackingUp,
    /// Loading and verifying the target blob
    ReadingTarget,
    /// Replacing the live file
    Writing,
    /// Re-reading the live file
    Verifying,
    /// Putting the original bytes back
    RollingBack,
    /// Finished
    Done,
}

/// Result of a single-file restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Version that was restored
    pub version_id: Uuid,
    /// Live file that was replaced
    pub file_path: PathBuf,
    /// Safety version captured before mutation, absent if the file did not exist
    pub backup_version: Option<FileVersion>,
    /// Bytes written to the live file
    pub bytes_written: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Phases traversed, in order
    pub phases: Vec<RestorePhase>,
}

/// Result of a whole-space restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceRestoreResult {
    /// Snapshot that was restored
    pub version_id: Uuid,
    /// Snapshot of the space taken before the swap
    pub backup_version: SpaceVersion,
    /// Top-level items moved into place
    pub items_restored: usize,
    /// Top-level items moved out of the way
    pub items_removed: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Storage usage of a space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Root of the space
    pub space_path: PathBuf,
    /// Control bytes plus original bytes
    pub total_bytes: u64,
    /// Bytes under the control directory
    pub control_bytes: u64,
    /// Bytes of tracked files outside the control directory
    pub original_bytes: u64,
    /// Number of file versions
    pub version_count: usize,
    /// Oldest file version timestamp
    pub oldest: Option<DateTime<Utc>>,
    /// Newest file version timestamp
    pub newest: Option<DateTime<Utc>>,
    /// Control bytes divided by original bytes, 0 when there are no originals
    pub utilization: f64,
}

/// Alert raised by retention enforcement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageAlert {
    /// Usage crossed the warning threshold; value is the fraction of the limit
    ApproachingLimit(f64),
    /// Usage reached the limit and cleanup ran
    LimitExceeded,
}

/// Callback receiving storage alerts for a space
pub type AlertHandler = Arc<dyn Fn(&Path, StorageAlert) + Send + Sync>;

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Versions deleted
    pub removed_versions: usize,
    /// Blob bytes reclaimed
    pub freed_bytes: u64,
    /// Per-version failures, cleanup continued past each
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// True when every deletion succeeded
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        let mut out = format!(
            "removed {} version(s), freed {}",
            self.removed_versions,
            crate::utils::format_bytes(self.freed_bytes)
        );
        if !self.errors.is_empty() {
            out.push_str(&format!(", {} error(s)", self.errors.len()));
        }
        out
    }
}

/// Result of enforcing a policy
#[derive(Debug, Clone)]
pub enum PolicyOutcome {
    /// Within bounds
    Compliant(String),
    /// Past the warning threshold, nothing deleted
    Warning(String),
    /// Cleanup ran
    Enforced(CleanupReport),
    /// Policy disabled
    Skipped(String),
}

/// Kind of change reported by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// File appeared
    Created,
    /// File content changed
    Modified,
    /// File disappeared
    Deleted,
    /// File moved
    Renamed,
    /// Something happened that the platform could not classify
    Unknown,
}

impl ChangeKind {
    /// Creates and modifications trigger captures
    pub fn triggers_capture(&self) -> bool {
        matches!(self, ChangeKind::Created | ChangeKind::Modified)
    }
}

/// Change delivered to a monitor callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    /// Root of the watched space
    pub space: PathBuf,
    /// Changed path
    pub path: PathBuf,
    /// What happened
    pub kind: ChangeKind,
    /// True when produced by the fallback scanner
    pub synthetic: bool,
}

/// Callback receiving monitor events
pub type EventHandler = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

/// Monitoring state of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    /// Never started
    Idle,
    /// Watching through native notifications
    Native,
    /// Degraded to polling
    Fallback,
    /// Stopped
    Stopped,
}

/// Options for diff generation
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Unchanged lines shown around each change
    pub context_lines: usize,
    /// Compare lines with surrounding whitespace trimmed
    pub ignore_whitespace: bool,
    /// Larger inputs are reported as binary instead of diffed
    pub max_file_size: u64,
    /// Largest LCS table (old lines × new lines) built for a changed region;
    /// bigger regions are shown as a block replacement
    pub max_table_cells: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: 3,
            ignore_whitespace: false,
            max_file_size: 10 * 1024 * 1024,
            max_table_cells: 16 * 1024 * 1024,
        }
    }
}

/// One line of a hunk; the number is 1-based in its own side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineChange {
    /// Line present only in the newer content
    Added(usize, String),
    /// Line present only in the older content
    Deleted(usize, String),
    /// Unchanged line shown for context
    Context(usize, String),
}

/// Contiguous region of changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    /// First line in the older content (1-based)
    pub from_line: usize,
    /// Lines of the older content covered
    pub from_count: usize,
    /// First line in the newer content (1-based)
    pub to_line: usize,
    /// Lines of the newer content covered
    pub to_count: usize,
    /// Lines in order
    pub changes: Vec<LineChange>,
}

/// How two contents relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    /// Same hash
    Identical,
    /// Line diff available
    Text,
    /// Binary or too large, no hunks
    Binary,
}

/// Difference between two versions of a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDiff {
    /// Older version
    pub from: Uuid,
    /// Newer version, `None` for the live file
    pub to: Option<Uuid>,
    /// File both sides belong to
    pub file_path: PathBuf,
    /// Relationship between the two contents
    pub kind: DiffKind,
    /// Hunks, empty unless `kind` is `Text`
    pub hunks: Vec<DiffHunk>,
    /// Added line count
    pub lines_added: usize,
    /// Deleted line count
    pub lines_deleted: usize,
}
