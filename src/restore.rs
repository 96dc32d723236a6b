//! Restore of files and whole spaces
//!
//! ## File restore
//!
//! ```text
//! Validating → BackingUp → ReadingTarget → Writing → Verifying → Done
//!                                             │           │
//!                                             └─► RollingBack ◄─┘
//! ```
//!
//! The target blob is read and hash-checked during validation, so a damaged
//! target fails before any safety version is recorded. The live file is then
//! read into memory and captured as a safety version before anything is
//! mutated, so every restore can itself be undone. The target
//! bytes are written with an atomic replace. If the write or verification
//! fails, the in-memory original is written back; if that also fails the
//! error is [`VersionError::RollbackFailed`], never a plain restore failure.
//!
//! ## Space restore
//!
//! The current tree is snapshotted first. The target snapshot is copied into
//! a staging directory under `.control/tmp/`; only after the copy completes
//! are live items moved aside and staged items moved into place (same-volume
//! renames). Any failure before the swap leaves the live tree untouched; a
//! failure during the swap rebuilds the tree from the pre-restore snapshot.

use crate::error::{Result, VersionError};
use crate::fs::atomic_write;
use crate::snapshot::{is_control_entry, SnapshotStore};
use crate::space::{path_hash, Space};
use crate::store::VersionStore;
use crate::types::{FileVersion, RestorePhase, RestoreResult, SpaceRestoreResult, SpaceVersion};
use crate::utils::{copy_tree, hash_data};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Coordinates restores against a [`VersionStore`] and [`SnapshotStore`]
#[derive(Debug, Clone)]
pub struct RestoreCoordinator {
    store: VersionStore,
    snapshots: SnapshotStore,
}

fn enter(phases: &mut Vec<RestorePhase>, phase: RestorePhase, path: &Path) {
    debug!("Restore of {:?}: {:?}", path, phase);
    phases.push(phase);
}

impl RestoreCoordinator {
    /// Create a coordinator
    pub fn new(store: VersionStore, snapshots: SnapshotStore) -> Self {
        Self { store, snapshots }
    }

    /// Replace the live content of `file_path` with `version`
    ///
    /// `comment` labels the safety version; a default label naming the
    /// target is used when absent.
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidVersion`] if `version` belongs to another file
    /// - [`VersionError::MetadataCorrupted`] if the target blob is missing or damaged
    /// - [`VersionError::RestorationFailed`] if the restore failed and the original is back in place
    /// - [`VersionError::RollbackFailed`] if the original could not be put back
    #[instrument(skip(self, space, version, comment), fields(version = %version.id))]
    pub fn restore(
        &self,
        space: &Space,
        file_path: &Path,
        version: &FileVersion,
        comment: Option<String>,
    ) -> Result<RestoreResult> {
        let start = Instant::now();
        let fs = self.store.fs().clone();
        let mut phases = Vec::new();

        let path = self.store.resolve(space, file_path)?;
        enter(&mut phases, RestorePhase::Validating, &path);
        if version.file_path != path {
            return Err(VersionError::invalid_version(format!(
                "Version {} belongs to {:?}, not {:?}",
                version.id, version.file_path, path
            )));
        }
        // Blobs are immutable, so a hash-checked read here stays valid
        let target = self.store.read(version)?;

        let space_lock = self.store.locks().space(space.root());
        let _space_guard = space_lock.read();
        let path_lock = self.store.locks().path(&path_hash(&path));
        let _path_guard = path_lock.lock();

        enter(&mut phases, RestorePhase::BackingUp, &path);
        let original = match fs.read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(VersionError::restoration(format!(
                    "Cannot read live file {:?}: {}",
                    path, e
                )))
            }
        };
        let backup = match &original {
            Some(bytes) => {
                let label = comment.unwrap_or_else(|| {
                    format!("Pre-restore backup before restoring {}", version.short_id())
                });
                let backup = self
                    .store
                    .store_locked(space, &path, bytes, Some(label))
                    .map_err(|e| {
                        VersionError::restoration(format!("Safety backup failed: {}", e))
                    })?;
                Some(backup)
            }
            None => None,
        };

        enter(&mut phases, RestorePhase::ReadingTarget, &path);
        debug!("Target {} holds {} verified bytes", version.short_id(), target.len());

        enter(&mut phases, RestorePhase::Writing, &path);
        if let Err(e) = atomic_write(fs.as_ref(), &path, &target) {
            return Err(self.roll_back(&path, original.as_deref(), backup.as_ref(), e, &mut phases));
        }

        enter(&mut phases, RestorePhase::Verifying, &path);
        let verified = match fs.read(&path) {
            Ok(bytes) if hash_data(&bytes) == version.content_hash => Ok(()),
            Ok(_) => Err(VersionError::restoration(format!(
                "{:?} does not match version {} after writing",
                path, version.id
            ))),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = verified {
            return Err(self.roll_back(&path, original.as_deref(), backup.as_ref(), e, &mut phases));
        }

        enter(&mut phases, RestorePhase::Done, &path);
        info!("Restored {:?} to version {}", path, version.short_id());
        Ok(RestoreResult {
            version_id: version.id,
            file_path: path,
            backup_version: backup,
            bytes_written: target.len() as u64,
            duration_ms: start.elapsed().as_millis() as u64,
            phases,
        })
    }

    fn roll_back(
        &self,
        path: &Path,
        original: Option<&[u8]>,
        backup: Option<&FileVersion>,
        cause: VersionError,
        phases: &mut Vec<RestorePhase>,
    ) -> VersionError {
        enter(phases, RestorePhase::RollingBack, path);
        let fs = self.store.fs();

        let recovered = match original {
            Some(bytes) => atomic_write(fs.as_ref(), path, bytes),
            None => match fs.remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        };

        match recovered {
            Ok(()) => {
                warn!("Restore of {:?} failed and was rolled back: {}", path, cause);
                VersionError::restoration(cause.to_string())
            }
            Err(e) => {
                let preserved = backup.map(|b| b.storage_path.clone());
                error!(
                    "Rollback of {:?} failed: {} (restore error: {}); previous content preserved at {:?}",
                    path, e, cause, preserved
                );
                VersionError::RollbackFailed {
                    message: format!("{}; rollback failed: {}", cause, e),
                    backup: preserved,
                }
            }
        }
    }

    /// Replace the whole tree of `space` with `version`
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidVersion`] if `version` was taken from another space
    /// - [`VersionError::RestorationFailed`] if the restore failed and the tree is as before
    /// - [`VersionError::RollbackFailed`] if the tree could not be rebuilt after a failed swap
    #[instrument(skip(self, space, version), fields(space = ?space.root(), version = %version.id))]
    pub fn restore_space(&self, space: &Space, version: &SpaceVersion) -> Result<SpaceRestoreResult> {
        let start = Instant::now();
        let fs = self.store.fs().clone();

        if version.space_path != space.root() {
            return Err(VersionError::invalid_version(format!(
                "Space version {} was taken from {:?}",
                version.id, version.space_path
            )));
        }
        if !fs.exists(&version.storage_path) {
            return Err(VersionError::corrupted(format!(
                "Tree for space version {} is missing",
                version.id
            )));
        }

        let space_lock = self.store.locks().space(space.root());
        let _space_guard = space_lock.write();

        let backup = self
            .snapshots
            .create(
                space,
                Some(format!("Pre-restore backup before restoring {}", version.short_id())),
            )
            .map_err(|e| VersionError::restoration(format!("Safety backup failed: {}", e)))?;

        let work = space.tmp_dir().join(Uuid::new_v4().simple().to_string());
        let staging = work.join("staging");
        let displaced = work.join("displaced");

        let staged = copy_tree(fs.as_ref(), &version.storage_path, &staging, &|_| false)
            .and_then(|_| Ok(fs.create_dir_all(&displaced)?));
        if let Err(e) = staged {
            self.discard_work(&work);
            return Err(VersionError::restoration(format!("Staging failed: {}", e)));
        }
        debug!("Staged space version {} in {:?}", version.short_id(), staging);

        match self.swap(space, &staging, &displaced) {
            Ok((items_removed, items_restored)) => {
                self.discard_work(&work);
                info!(
                    "Restored space {:?} to version {} ({} items in, {} out)",
                    space.root(),
                    version.short_id(),
                    items_restored,
                    items_removed
                );
                Ok(SpaceRestoreResult {
                    version_id: version.id,
                    backup_version: backup,
                    items_restored,
                    items_removed,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(cause) => match self.rebuild_from(space, &backup) {
                Ok(()) => {
                    self.discard_work(&work);
                    warn!("Space restore of {:?} failed and was rolled back: {}", space.root(), cause);
                    Err(VersionError::restoration(cause.to_string()))
                }
                Err(e) => {
                    error!(
                        "Rollback of space {:?} failed: {} (restore error: {}); previous tree preserved at {:?}",
                        space.root(),
                        e,
                        cause,
                        backup.storage_path
                    );
                    Err(VersionError::RollbackFailed {
                        message: format!("{}; rollback failed: {}", cause, e),
                        backup: Some(backup.storage_path),
                    })
                }
            },
        }
    }

    fn live_items(&self, space: &Space) -> Result<Vec<PathBuf>> {
        Ok(self
            .store
            .fs()
            .read_dir(space.root())?
            .into_iter()
            .filter(|p| !is_control_entry(p))
            .collect())
    }

    /// Move live items aside, then staged items in
    fn swap(&self, space: &Space, staging: &Path, displaced: &Path) -> Result<(usize, usize)> {
        let fs = self.store.fs();
        let mut removed = 0;
        for item in self.live_items(space)? {
            if let Some(name) = item.file_name() {
                fs.rename(&item, &displaced.join(name))?;
                removed += 1;
            }
        }

        let mut restored = 0;
        for item in fs.read_dir(staging)? {
            if let Some(name) = item.file_name() {
                fs.rename(&item, &space.root().join(name))?;
                restored += 1;
            }
        }
        Ok((removed, restored))
    }

    /// Clear the live tree and copy `backup` back into it
    fn rebuild_from(&self, space: &Space, backup: &SpaceVersion) -> Result<()> {
        let fs = self.store.fs();
        for item in self.live_items(space)? {
            let is_dir = fs.metadata(&item).map(|m| m.is_dir()).unwrap_or(false);
            if is_dir {
                fs.remove_dir_all(&item)?;
            } else {
                fs.remove_file(&item)?;
            }
        }
        copy_tree(fs.as_ref(), &backup.storage_path, space.root(), &|_| false)?;
        Ok(())
    }

    fn discard_work(&self, work: &Path) {
        if let Err(e) = self.store.fs().remove_dir_all(work) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove restore work directory {:?}: {}", work, e);
            }
        }
    }
}
