//! Service facade tying the components together
//!
//! A [`VersionKeeper`] owns one [`VersionStore`] (and with it the lock table
//! every component shares), the snapshot store, the restore coordinator, the
//! retention enforcer and the change monitor. It is constructed explicitly,
//! usually through [`VersionKeeperBuilder`], and passed to whatever needs it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use verspace::VersionKeeper;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keeper = VersionKeeper::builder()
//!     .exclude_patterns(vec!["*.log".to_string()])
//!     .build()?;
//!
//! let space = keeper.create_space(Path::new("./notes"))?;
//! let version = keeper.capture(&space, Path::new("./notes/todo.md"), Some("before edit".into()))?;
//! keeper.restore(&space, Path::new("./notes/todo.md"), &version.short_id(), None)?;
//! # Ok(())
//! # }
//! ```

use crate::diff;
use crate::error::{Result, VersionError};
use crate::fs::{FileSystem, StdFileSystem};
use crate::monitor::{ChangeMonitor, MonitorStats};
use crate::restore::RestoreCoordinator;
use crate::retention::RetentionEnforcer;
use crate::snapshot::SnapshotStore;
use crate::space::Space;
use crate::store::VersionStore;
use crate::types::{
    AlertHandler, DiffOptions, EventHandler, FileVersion, MonitorConfig, MonitorState,
    PolicyOutcome, RestoreResult, SpaceConfig, SpaceRestoreResult, SpaceVersion, StoragePolicy,
    StorageUsage, VersionDiff,
};
use globset::Glob;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

fn join_error(e: tokio::task::JoinError) -> VersionError {
    VersionError::internal(format!("blocking task failed: {}", e))
}

/// Versioning service for any number of spaces
pub struct VersionKeeper {
    store: VersionStore,
    snapshots: SnapshotStore,
    restorer: RestoreCoordinator,
    retention: RetentionEnforcer,
    monitor: ChangeMonitor,
    defaults: SpaceConfig,
    diff_options: DiffOptions,
}

impl fmt::Debug for VersionKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionKeeper")
            .field("store", &self.store)
            .field("monitor", &self.monitor)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl VersionKeeper {
    /// Keeper with default settings on the real filesystem
    pub fn new() -> Self {
        VersionKeeperBuilder::new().assemble()
    }

    /// Start configuring a keeper
    pub fn builder() -> VersionKeeperBuilder {
        VersionKeeperBuilder::new()
    }

    /// The underlying version store
    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// The retention enforcer
    pub fn retention(&self) -> &RetentionEnforcer {
        &self.retention
    }

    /// The change monitor
    pub fn monitor(&self) -> &ChangeMonitor {
        &self.monitor
    }

    /// Configuration given to new spaces
    pub fn default_config(&self) -> &SpaceConfig {
        &self.defaults
    }

    // Spaces

    /// Start tracking `root` with the keeper's default configuration
    pub fn create_space(&self, root: &Path) -> Result<Space> {
        Space::create(root, self.defaults.clone())
    }

    /// Open a tracked space
    pub fn open_space(&self, root: &Path) -> Result<Space> {
        Space::open(root)
    }

    /// Open the space containing `path`
    pub fn find_space(&self, path: &Path) -> Result<Space> {
        Space::find_for(path)
    }

    /// Stop monitoring `space` and delete all of its version data
    pub fn remove_space(&self, space: Space) -> Result<()> {
        self.monitor.stop(space.root());
        space.destroy()
    }

    // Files

    /// Capture the current content of `file_path`
    pub fn capture(&self, space: &Space, file_path: &Path, comment: Option<String>) -> Result<FileVersion> {
        self.store.capture(space, file_path, comment)
    }

    /// Stored bytes of `version`, verified against its hash
    pub fn read(&self, version: &FileVersion) -> Result<Vec<u8>> {
        self.store.read(version)
    }

    /// Versions of `file_path`, newest first
    pub fn list_versions(&self, space: &Space, file_path: &Path) -> Result<Vec<FileVersion>> {
        let path = self.store.resolve(space, file_path)?;
        self.store.list_versions(space, &path)
    }

    /// Version of `file_path` by id or unique id prefix
    pub fn find_version(&self, space: &Space, file_path: &Path, id: &str) -> Result<FileVersion> {
        let path = self.store.resolve(space, file_path)?;
        self.store.find_version(space, &path, id)
    }

    /// Restore `file_path` to the version identified by `id`
    pub fn restore(
        &self,
        space: &Space,
        file_path: &Path,
        id: &str,
        comment: Option<String>,
    ) -> Result<RestoreResult> {
        let version = self.find_version(space, file_path, id)?;
        self.restorer.restore(space, file_path, &version, comment)
    }

    // Whole-space versions

    /// Copy the whole tree into a new space version
    #[instrument(skip(self, space, comment), fields(space = ?space.root()))]
    pub fn snapshot_space(&self, space: &Space, comment: Option<String>) -> Result<SpaceVersion> {
        let lock = self.store.locks().space(space.root());
        let _guard = lock.read();
        self.snapshots.create(space, comment)
    }

    /// Space versions, newest first
    pub fn list_space_versions(&self, space: &Space) -> Result<Vec<SpaceVersion>> {
        self.snapshots.list(space)
    }

    /// Restore the whole tree to the space version identified by `id`
    pub fn restore_space(&self, space: &Space, id: &str) -> Result<SpaceRestoreResult> {
        let version = self.snapshots.get(space, id)?;
        self.restorer.restore_space(space, &version)
    }

    // Retention

    /// Measure storage used by `space`
    pub fn usage(&self, space: &Space) -> Result<StorageUsage> {
        self.retention.usage(space)
    }

    /// Apply `policy` to `space`
    pub fn enforce(&self, space: &Space, policy: &StoragePolicy) -> Result<PolicyOutcome> {
        self.retention.enforce(space, policy)
    }

    /// Apply the space's configured policy every `every`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_retention(&self, space: &Space, every: Duration) -> JoinHandle<()> {
        let policy = space.config().storage_policy;
        self.retention.spawn_periodic(space.clone(), policy, every)
    }

    // Monitoring

    /// Watch `space`, capturing changed files; false if already watched
    pub fn start_monitoring(&self, space: &Space, on_event: EventHandler) -> Result<bool> {
        self.monitor.start(space, on_event)
    }

    /// Stop watching `space`; false if it was not watched
    pub fn stop_monitoring(&self, space: &Space) -> bool {
        self.monitor.stop(space.root())
    }

    /// Monitoring state of `space`
    pub fn monitor_state(&self, space: &Space) -> MonitorState {
        self.monitor.state(space.root())
    }

    /// Monitor counters of `space`, if it was ever watched
    pub fn monitor_stats(&self, space: &Space) -> Option<MonitorStats> {
        self.monitor.stats(space.root())
    }

    // Diff

    /// Compare two versions of `file_path`
    pub fn diff_versions(&self, space: &Space, file_path: &Path, from: &str, to: &str) -> Result<VersionDiff> {
        let from = self.find_version(space, file_path, from)?;
        let to = self.find_version(space, file_path, to)?;
        diff::diff_versions(&self.store, &from, &to, &self.diff_options)
    }

    /// Compare a version of `file_path` with its live content
    pub fn diff_with_current(&self, space: &Space, file_path: &Path, id: &str) -> Result<VersionDiff> {
        let version = self.find_version(space, file_path, id)?;
        diff::diff_with_current(&self.store, &version, &self.diff_options)
    }

    // Async wrappers

    /// [`capture`](Self::capture) on the blocking pool
    pub async fn capture_async(&self, space: &Space, file_path: &Path, comment: Option<String>) -> Result<FileVersion> {
        let store = self.store.clone();
        let space = space.clone();
        let path = file_path.to_path_buf();
        tokio::task::spawn_blocking(move || store.capture(&space, &path, comment))
            .await
            .map_err(join_error)?
    }

    /// [`restore`](Self::restore) on the blocking pool
    pub async fn restore_async(
        &self,
        space: &Space,
        file_path: &Path,
        id: &str,
        comment: Option<String>,
    ) -> Result<RestoreResult> {
        let version = self.find_version(space, file_path, id)?;
        let restorer = self.restorer.clone();
        let space = space.clone();
        let path: PathBuf = file_path.to_path_buf();
        tokio::task::spawn_blocking(move || restorer.restore(&space, &path, &version, comment))
            .await
            .map_err(join_error)?
    }

    /// [`restore_space`](Self::restore_space) on the blocking pool
    pub async fn restore_space_async(&self, space: &Space, id: &str) -> Result<SpaceRestoreResult> {
        let version = self.snapshots.get(space, id)?;
        let restorer = self.restorer.clone();
        let space = space.clone();
        tokio::task::spawn_blocking(move || restorer.restore_space(&space, &version))
            .await
            .map_err(join_error)?
    }

    /// [`usage`](Self::usage) on the blocking pool
    pub async fn usage_async(&self, space: &Space) -> Result<StorageUsage> {
        let retention = self.retention.clone();
        let space = space.clone();
        tokio::task::spawn_blocking(move || retention.usage(&space))
            .await
            .map_err(join_error)?
    }
}

impl Default for VersionKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`VersionKeeper`]
///
/// # Default Values
///
/// - filesystem: [`StdFileSystem`]
/// - storage policy: 10 GiB max size, warning at 80%
/// - exclude patterns: [`default_exclude_patterns`](crate::types::default_exclude_patterns)
/// - monitor: [`MonitorConfig::default`]
/// - no alert handler
pub struct VersionKeeperBuilder {
    fs: Arc<dyn FileSystem>,
    config: SpaceConfig,
    alert_handler: Option<AlertHandler>,
    diff_options: DiffOptions,
}

impl fmt::Debug for VersionKeeperBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionKeeperBuilder")
            .field("fs", &self.fs)
            .field("config", &self.config)
            .field("alert_handler", &self.alert_handler.is_some())
            .finish()
    }
}

impl VersionKeeperBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            fs: Arc::new(StdFileSystem),
            config: SpaceConfig::default(),
            alert_handler: None,
            diff_options: DiffOptions::default(),
        }
    }

    /// Do version I/O through `fs`
    pub fn filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Storage policy for new spaces
    pub fn storage_policy(mut self, policy: StoragePolicy) -> Self {
        self.config.storage_policy = policy;
        self
    }

    /// Exclude patterns for new spaces, replacing the defaults
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Monitor timing for new spaces
    pub fn monitor_config(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    /// Receive storage alerts
    pub fn alert_handler(mut self, handler: AlertHandler) -> Self {
        self.alert_handler = Some(handler);
        self
    }

    /// Options used by the diff operations
    pub fn diff_options(mut self, options: DiffOptions) -> Self {
        self.diff_options = options;
        self
    }

    /// Validate the configuration and build the keeper
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidConfiguration`] for a bad storage policy
    /// - [`VersionError::InvalidPattern`] for an exclude pattern that does not compile
    pub fn build(self) -> Result<VersionKeeper> {
        self.config.storage_policy.validate()?;
        for pattern in &self.config.exclude_patterns {
            Glob::new(pattern)?;
        }
        let keeper = self.assemble();
        info!("Version keeper ready");
        Ok(keeper)
    }

    fn assemble(self) -> VersionKeeper {
        let store = VersionStore::new(self.fs.clone());
        let snapshots = SnapshotStore::new(self.fs);
        let mut retention = RetentionEnforcer::new(store.clone());
        if let Some(handler) = self.alert_handler {
            retention = retention.with_alert_handler(handler);
        }
        debug!("Assembling keeper with {:?}", self.config);

        VersionKeeper {
            restorer: RestoreCoordinator::new(store.clone(), snapshots.clone()),
            monitor: ChangeMonitor::new(store.clone()),
            store,
            snapshots,
            retention,
            defaults: self.config,
            diff_options: self.diff_options,
        }
    }
}

impl Default for VersionKeeperBuilder {
    fn default() -> Self {
        Self::new()
    }
}
