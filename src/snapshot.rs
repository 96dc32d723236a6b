//! Whole-space versions
//!
//! A [`SpaceVersion`] is a full copy of a space's tree (minus the control
//! directory) kept under `.control/space_versions/<id>/`, with its record at
//! `.control/space_metadata/<id>.json`. Space restore swaps one of these
//! copies into place.
//!
//! Snapshots are not touched by retention; their bytes are counted in the
//! control directory size.

use crate::error::{Result, VersionError};
use crate::fs::{atomic_write, FileSystem};
use crate::space::{Space, CONTROL_DIR};
use crate::types::SpaceVersion;
use crate::utils::copy_tree;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// True for the control directory of a space
pub(crate) fn is_control_entry(path: &Path) -> bool {
    path.file_name().map(|n| n == CONTROL_DIR).unwrap_or(false)
}

/// Creates, lists and deletes whole-space versions
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    fs: Arc<dyn FileSystem>,
}

impl SnapshotStore {
    /// Create a snapshot store doing record I/O through `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn record_path(space: &Space, id: &Uuid) -> PathBuf {
        space.space_metadata_dir().join(format!("{}.json", id))
    }

    /// Copy the space's current tree into a new snapshot
    ///
    /// The copied tree is removed again if the copy or the record write
    /// fails. Callers coordinate with concurrent writers through the space
    /// lock.
    #[instrument(skip(self, space, comment), fields(space = ?space.root()))]
    pub fn create(&self, space: &Space, comment: Option<String>) -> Result<SpaceVersion> {
        let id = Uuid::new_v4();
        let tree = space.space_versions_dir().join(id.to_string());

        let stats = match copy_tree(self.fs.as_ref(), space.root(), &tree, &is_control_entry) {
            Ok(stats) => stats,
            Err(e) => {
                self.discard_tree(&tree);
                return Err(e);
            }
        };

        let version = SpaceVersion {
            id,
            space_path: space.root().to_path_buf(),
            timestamp: Utc::now(),
            comment,
            storage_path: tree.clone(),
            file_count: stats.files,
            total_size: stats.bytes,
        };

        let saved = self
            .fs
            .create_dir_all(&space.space_metadata_dir())
            .map_err(VersionError::from)
            .and_then(|_| Ok(serde_json::to_vec_pretty(&version)?))
            .and_then(|json| atomic_write(self.fs.as_ref(), &Self::record_path(space, &id), &json));
        if let Err(e) = saved {
            self.discard_tree(&tree);
            return Err(e);
        }

        info!(
            "Created space version {} ({} files, {} bytes)",
            version.short_id(),
            version.file_count,
            version.total_size
        );
        Ok(version)
    }

    fn discard_tree(&self, tree: &Path) {
        if let Err(e) = self.fs.remove_dir_all(tree) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove partial snapshot tree {:?}: {}", tree, e);
            }
        }
    }

    /// Every readable snapshot, newest first
    pub fn list(&self, space: &Space) -> Result<Vec<SpaceVersion>> {
        let entries = match self.fs.read_dir(&space.space_metadata_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let hidden = entry
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            if hidden || entry.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let parsed = self
                .fs
                .read(&entry)
                .map_err(VersionError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<SpaceVersion>(&bytes)?));
            match parsed {
                Ok(version) => versions.push(version),
                Err(e) => warn!("Skipping unreadable space version record {:?}: {}", entry, e),
            }
        }

        versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(versions)
    }

    /// Find a snapshot by full id or unique id prefix
    pub fn get(&self, space: &Space, id: &str) -> Result<SpaceVersion> {
        let wanted = id.to_ascii_lowercase();
        let mut matches = self
            .list(space)?
            .into_iter()
            .filter(|v| v.id.to_string().starts_with(&wanted));

        match (matches.next(), matches.next()) {
            (Some(v), None) => Ok(v),
            (None, _) => Err(VersionError::invalid_version(format!(
                "No space version {}",
                id
            ))),
            (Some(_), Some(_)) => Err(VersionError::invalid_version(format!(
                "Space version prefix {} is ambiguous",
                id
            ))),
        }
    }

    /// Remove a snapshot's tree and record
    pub fn delete(&self, space: &Space, version: &SpaceVersion) -> Result<()> {
        match self.fs.remove_dir_all(&version.storage_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match self.fs.remove_file(&Self::record_path(space, &version.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
