//! Durable index of file version records
//!
//! One pretty-printed JSON record per version, stored at
//! `.control/file_metadata/<pathHash>/<versionId>.json`. Records are written
//! atomically and never overwritten. Loading isolates damaged records: a
//! record that fails to parse is logged and skipped, and the rest of the
//! version set is still returned.

use crate::error::{Result, VersionError};
use crate::fs::{atomic_write, FileSystem};
use crate::space::{path_hash, Space};
use crate::types::FileVersion;
use rayon::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

/// File-backed directory of [`FileVersion`] records
#[derive(Debug, Clone)]
pub struct MetadataIndex {
    fs: Arc<dyn FileSystem>,
}

impl MetadataIndex {
    /// Create an index doing its I/O through `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn record_path(space: &Space, version: &FileVersion) -> PathBuf {
        space
            .record_dir(&path_hash(&version.file_path))
            .join(format!("{}.json", version.id))
    }

    /// Persist a record
    ///
    /// # Errors
    ///
    /// - [`VersionError::DuplicateVersion`] if a record with this id exists
    /// - [`VersionError::Io`] if the write fails; nothing is left behind
    pub fn save(&self, space: &Space, version: &FileVersion) -> Result<()> {
        let path = Self::record_path(space, version);
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        if self.fs.exists(&path) {
            return Err(VersionError::DuplicateVersion(version.id.to_string()));
        }

        let json = serde_json::to_vec_pretty(version)?;
        atomic_write(self.fs.as_ref(), &path, &json)?;
        trace!("Saved record {} for {:?}", version.id, version.file_path);
        Ok(())
    }

    /// Every readable record for `file_path`, unsorted
    ///
    /// Records that fail to parse, or that name a different file, are
    /// skipped with a warning.
    pub fn load(&self, space: &Space, file_path: &Path) -> Result<Vec<FileVersion>> {
        let dir = space.record_dir(&path_hash(file_path));
        let mut versions = self.load_dir(&dir)?;
        versions.retain(|v| {
            if v.file_path == file_path {
                true
            } else {
                warn!(
                    "Skipping record {} filed under {:?} but naming {:?}",
                    v.id, file_path, v.file_path
                );
                false
            }
        });
        Ok(versions)
    }

    fn load_dir(&self, dir: &Path) -> Result<Vec<FileVersion>> {
        let entries = match self.fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::with_capacity(entries.len());
        for entry in entries {
            let is_record = entry.extension().map(|ext| ext == "json").unwrap_or(false)
                && !entry
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true);
            if !is_record {
                continue;
            }

            let parsed = self
                .fs
                .read(&entry)
                .map_err(VersionError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<FileVersion>(&bytes)?));
            match parsed {
                Ok(version) => versions.push(version),
                Err(e) => warn!("Skipping unreadable version record {:?}: {}", entry, e),
            }
        }
        Ok(versions)
    }

    /// Remove a record; succeeds if it is already gone
    pub fn delete(&self, space: &Space, version: &FileVersion) -> Result<()> {
        match self.fs.remove_file(&Self::record_path(space, version)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path hashes that have a record directory
    pub fn list_path_hashes(&self, space: &Space) -> Result<Vec<String>> {
        let entries = match self.fs.read_dir(&space.file_metadata_root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    /// Every readable record in the space, across all files
    pub fn load_all(&self, space: &Space) -> Result<Vec<FileVersion>> {
        let root = space.file_metadata_root();
        let per_path: Vec<Result<Vec<FileVersion>>> = self
            .list_path_hashes(space)?
            .par_iter()
            .map(|hash| self.load_dir(&root.join(hash)))
            .collect();

        let mut all = Vec::new();
        for versions in per_path {
            all.extend(versions?);
        }
        Ok(all)
    }
}
