//! Content-addressed version blobs
//!
//! [`VersionStore`] captures the current bytes of a file as an immutable
//! blob plus a metadata record, and reads blobs back with hash verification.
//!
//! ## Locking
//!
//! Every operation touching one file takes the space lock shared and then the
//! per-path lock for that file's path hash. Captures of the same file are
//! serialized; captures of different files run in parallel. Space restore
//! takes the space lock exclusively, which excludes all file operations in
//! that space.
//!
//! ## Capture ordering
//!
//! The blob is written first, then the record. If the record write fails the
//! blob is removed again, so the store never holds a blob without a record.

use crate::error::{Result, VersionError};
use crate::fs::{atomic_write, FileSystem};
use crate::metadata::MetadataIndex;
use crate::space::{normalize_path, path_hash, Space, CONTROL_DIR};
use crate::types::FileVersion;
use crate::utils::{hash_data, remove_dir_if_empty};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lock table shared by the store, restore coordinator and monitor
#[derive(Debug, Default)]
pub struct LockTable {
    spaces: DashMap<PathBuf, Arc<RwLock<()>>>,
    paths: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    /// Lock guarding a whole space
    pub fn space(&self, root: &Path) -> Arc<RwLock<()>> {
        self.spaces
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Lock guarding one file, keyed by path hash
    pub fn path(&self, hash: &str) -> Arc<Mutex<()>> {
        self.paths
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Writes, reads and enumerates file versions
#[derive(Debug, Clone)]
pub struct VersionStore {
    fs: Arc<dyn FileSystem>,
    index: MetadataIndex,
    locks: Arc<LockTable>,
}

impl VersionStore {
    /// Create a store doing its I/O through `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            index: MetadataIndex::new(fs.clone()),
            fs,
            locks: Arc::new(LockTable::default()),
        }
    }

    /// Filesystem used for all I/O
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Metadata index backing this store
    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Shared lock table
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Resolve `file_path` and check it can hold versions in `space`
    pub fn resolve(&self, space: &Space, file_path: &Path) -> Result<PathBuf> {
        let path = normalize_path(file_path)?;
        if !space.contains(&path) || path == space.root() {
            return Err(VersionError::invalid_path(format!(
                "{:?} is not a file inside space {:?}",
                path,
                space.root()
            )));
        }
        if path.starts_with(space.root().join(CONTROL_DIR)) {
            return Err(VersionError::invalid_path(format!(
                "{:?} is inside the control directory",
                path
            )));
        }
        Ok(path)
    }

    /// Capture the current content of `file_path` as a new version
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidPath`] if the file is outside the space or cannot be read
    /// - [`VersionError::Io`] if the blob or record cannot be written; nothing is left behind
    #[instrument(skip(self, space, comment), fields(space = ?space.root()))]
    pub fn capture(
        &self,
        space: &Space,
        file_path: &Path,
        comment: Option<String>,
    ) -> Result<FileVersion> {
        let path = self.resolve(space, file_path)?;

        let space_lock = self.locks.space(space.root());
        let _space_guard = space_lock.read();
        let path_lock = self.locks.path(&path_hash(&path));
        let _path_guard = path_lock.lock();

        let meta = self
            .fs
            .metadata(&path)
            .map_err(|e| VersionError::invalid_path(format!("Cannot access {:?}: {}", path, e)))?;
        if !meta.is_file() {
            return Err(VersionError::invalid_path(format!("{:?} is not a regular file", path)));
        }
        let bytes = self
            .fs
            .read(&path)
            .map_err(|e| VersionError::invalid_path(format!("Cannot read {:?}: {}", path, e)))?;

        self.store_locked(space, &path, &bytes, comment)
    }

    /// Store `bytes` as a version of `path`
    ///
    /// The caller must hold the path lock for `path`.
    pub(crate) fn store_locked(
        &self,
        space: &Space,
        path: &Path,
        bytes: &[u8],
        comment: Option<String>,
    ) -> Result<FileVersion> {
        let hash = hash_data(bytes);
        let blob_dir = space.blob_dir(&path_hash(path));
        self.fs.create_dir_all(&blob_dir)?;

        let mut id = Uuid::new_v4();
        while self.fs.exists(&blob_dir.join(format!("{}.blob", id))) {
            id = Uuid::new_v4();
        }
        let blob_path = blob_dir.join(format!("{}.blob", id));

        atomic_write(self.fs.as_ref(), &blob_path, bytes)?;

        let version = FileVersion {
            id,
            file_path: path.to_path_buf(),
            timestamp: Utc::now(),
            size: bytes.len() as u64,
            comment,
            content_hash: hash,
            storage_path: blob_path.clone(),
        };

        if let Err(e) = self.index.save(space, &version) {
            if let Err(rm) = self.fs.remove_file(&blob_path) {
                warn!("Could not remove blob {:?} after failed record write: {}", blob_path, rm);
            }
            return Err(e);
        }

        info!(
            "Captured version {} of {:?} ({} bytes)",
            version.short_id(),
            path,
            version.size
        );
        Ok(version)
    }

    /// Load a version's bytes, verifying them against the recorded hash
    ///
    /// # Errors
    ///
    /// - [`VersionError::MetadataCorrupted`] if the blob is missing or its hash differs
    pub fn read(&self, version: &FileVersion) -> Result<Vec<u8>> {
        let bytes = match self.fs.read(&version.storage_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VersionError::corrupted(format!(
                    "Blob for version {} is missing",
                    version.id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = hash_data(&bytes);
        if actual != version.content_hash {
            return Err(VersionError::corrupted(format!(
                "Blob for version {} hashes to {} but {} was recorded",
                version.id, actual, version.content_hash
            )));
        }
        Ok(bytes)
    }

    /// Versions of `file_path`, newest first
    pub fn list_versions(&self, space: &Space, file_path: &Path) -> Result<Vec<FileVersion>> {
        let path = normalize_path(file_path)?;
        let mut versions = self.index.load(space, &path)?;
        versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(versions)
    }

    /// Find a version of `file_path` by full id or unique id prefix
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidVersion`] if no version matches, or the prefix is ambiguous
    pub fn find_version(&self, space: &Space, file_path: &Path, id: &str) -> Result<FileVersion> {
        let versions = self.list_versions(space, file_path)?;
        let wanted = id.to_ascii_lowercase();
        let mut matches = versions
            .into_iter()
            .filter(|v| v.id.to_string().starts_with(&wanted));

        match (matches.next(), matches.next()) {
            (Some(v), None) => Ok(v),
            (None, _) => Err(VersionError::invalid_version(format!(
                "No version {} for {:?}",
                id, file_path
            ))),
            (Some(_), Some(_)) => Err(VersionError::invalid_version(format!(
                "Version prefix {} is ambiguous",
                id
            ))),
        }
    }

    /// Delete a version's blob and record, returning the bytes freed
    ///
    /// The blob goes first so a failure leaves a record that a later
    /// cleanup can retry.
    pub fn delete_version(&self, space: &Space, version: &FileVersion) -> Result<u64> {
        let hash = path_hash(&version.file_path);
        let space_lock = self.locks.space(space.root());
        let _space_guard = space_lock.read();
        let path_lock = self.locks.path(&hash);
        let _path_guard = path_lock.lock();

        let freed = match self.fs.metadata(&version.storage_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        match self.fs.remove_file(&version.storage_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.delete(space, version)?;

        for dir in [space.blob_dir(&hash), space.record_dir(&hash)] {
            if let Err(e) = remove_dir_if_empty(&dir) {
                debug!("Leaving directory {:?} in place: {}", dir, e);
            }
        }

        debug!("Deleted version {} of {:?}", version.short_id(), version.file_path);
        Ok(freed)
    }
}
