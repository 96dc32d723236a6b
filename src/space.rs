//! Tracked spaces and their control directory
//!
//! A space is a directory under version tracking. All of its version data
//! lives in a hidden control directory at the root:
//!
//! ```text
//! <root>/.control/
//! ├── metadata.json                 # SpaceMetadata (config, timestamps)
//! ├── file_versions/<pathHash>/     # <versionId>.blob
//! ├── file_metadata/<pathHash>/     # <versionId>.json
//! ├── space_versions/<versionId>/   # copied trees for space restore
//! ├── space_metadata/               # <versionId>.json
//! └── tmp/                          # staging for space restore
//! ```
//!
//! `<pathHash>` is the SHA-256 of the absolute file path, so storage
//! locations do not depend on path length or characters.

use crate::error::{Result, VersionError};
use crate::fs::{atomic_write, StdFileSystem};
use crate::types::{SpaceConfig, SpaceMetadata, FORMAT_VERSION};
use crate::utils::hash_data;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Name of the hidden control directory at the root of every space
pub const CONTROL_DIR: &str = ".control";

const METADATA_FILE: &str = "metadata.json";

/// SHA-256 hex digest of a path's UTF-8 bytes
pub fn path_hash(path: &Path) -> String {
    hash_data(path.to_string_lossy().as_bytes())
}

/// Absolute, symlink-resolved form of `path`
///
/// Paths that do not exist yet are resolved through their parent so a
/// deleted file keeps the same path hash it had while it existed.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    if let Ok(canonical) = absolute.canonicalize() {
        return Ok(canonical);
    }

    let name = absolute
        .file_name()
        .ok_or_else(|| VersionError::invalid_path(format!("{:?} has no file name", path)))?;
    let parent = absolute
        .parent()
        .ok_or_else(|| VersionError::invalid_path(format!("{:?} has no parent", path)))?;
    let parent = parent
        .canonicalize()
        .map_err(|_| VersionError::invalid_path(format!("Parent of {:?} does not exist", path)))?;
    Ok(parent.join(name))
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// A directory under version tracking
#[derive(Debug, Clone)]
pub struct Space {
    root: PathBuf,
    metadata: SpaceMetadata,
    excludes: GlobSet,
}

impl Space {
    /// Start tracking `root`
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidPath`] if `root` is not an existing directory
    /// - [`VersionError::SpaceAlreadyExists`] if `root` is already tracked
    /// - [`VersionError::InvalidConfiguration`] / [`VersionError::InvalidPattern`] for bad config
    #[instrument(skip(config))]
    pub fn create(root: &Path, config: SpaceConfig) -> Result<Self> {
        if !root.is_dir() {
            return Err(VersionError::invalid_path(format!(
                "{:?} is not an existing directory",
                root
            )));
        }
        let root = root.canonicalize()?;
        let control = root.join(CONTROL_DIR);
        if control.join(METADATA_FILE).exists() {
            return Err(VersionError::SpaceAlreadyExists(root));
        }

        config.storage_policy.validate()?;
        let excludes = build_excludes(&config.exclude_patterns)?;

        for dir in [
            "file_versions",
            "file_metadata",
            "space_versions",
            "space_metadata",
        ] {
            fs::create_dir_all(control.join(dir))?;
        }

        let now = Utc::now();
        let metadata = SpaceMetadata {
            format_version: FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            last_accessed: now,
            config,
        };
        let space = Self { root, metadata, excludes };
        space.save_metadata()?;

        info!("Created space at {:?}", space.root);
        Ok(space)
    }

    /// Open an existing space rooted at `root`
    ///
    /// Refreshes `last_accessed`; failure to persist that refresh is logged
    /// and ignored.
    #[instrument]
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|_| VersionError::SpaceNotInitialized(root.to_path_buf()))?;
        let metadata_path = root.join(CONTROL_DIR).join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(VersionError::SpaceNotInitialized(root));
        }

        let mut metadata: SpaceMetadata = serde_json::from_slice(&fs::read(&metadata_path)?)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(VersionError::InvalidConfiguration(format!(
                "space format {} is newer than supported format {}",
                metadata.format_version, FORMAT_VERSION
            )));
        }
        let excludes = build_excludes(&metadata.config.exclude_patterns)?;
        metadata.last_accessed = Utc::now();

        let space = Self { root, metadata, excludes };
        if let Err(e) = space.save_metadata() {
            warn!("Could not refresh last access time for {:?}: {}", space.root, e);
        }
        debug!("Opened space at {:?}", space.root);
        Ok(space)
    }

    /// Find the space containing `path` by walking up its ancestors
    ///
    /// # Errors
    ///
    /// - [`VersionError::InvalidPath`] if no ancestor is a tracked space
    pub fn find_for(path: &Path) -> Result<Self> {
        let path = normalize_path(path)?;
        for ancestor in path.ancestors() {
            if ancestor.join(CONTROL_DIR).join(METADATA_FILE).is_file() {
                return Self::open(ancestor);
            }
        }
        Err(VersionError::invalid_path(format!(
            "{:?} is not inside a tracked space",
            path
        )))
    }

    /// Stop tracking and delete all version data
    #[instrument(skip(self), fields(root = ?self.root))]
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir_all(self.control_dir())?;
        info!("Removed tracking from {:?}", self.root);
        Ok(())
    }

    fn save_metadata(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.metadata)?;
        atomic_write(&StdFileSystem, &self.control_dir().join(METADATA_FILE), &json)
    }

    /// Replace the configuration and persist it
    pub fn update_config(&mut self, config: SpaceConfig) -> Result<()> {
        config.storage_policy.validate()?;
        self.excludes = build_excludes(&config.exclude_patterns)?;
        self.metadata.config = config;
        self.save_metadata()
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted metadata
    pub fn metadata(&self) -> &SpaceMetadata {
        &self.metadata
    }

    /// Current configuration
    pub fn config(&self) -> &SpaceConfig {
        &self.metadata.config
    }

    /// `<root>/.control`
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// Directory of blobs for one file
    pub fn blob_dir(&self, path_hash: &str) -> PathBuf {
        self.control_dir().join("file_versions").join(path_hash)
    }

    /// Directory of metadata records for one file
    pub fn record_dir(&self, path_hash: &str) -> PathBuf {
        self.control_dir().join("file_metadata").join(path_hash)
    }

    /// Parent of all per-file record directories
    pub fn file_metadata_root(&self) -> PathBuf {
        self.control_dir().join("file_metadata")
    }

    /// Parent of all snapshot trees
    pub fn space_versions_dir(&self) -> PathBuf {
        self.control_dir().join("space_versions")
    }

    /// Directory of snapshot records
    pub fn space_metadata_dir(&self) -> PathBuf {
        self.control_dir().join("space_metadata")
    }

    /// Scratch area for space restore, same volume as the root
    pub fn tmp_dir(&self) -> PathBuf {
        self.control_dir().join("tmp")
    }

    /// Whether `path` lies under the root
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// `path` relative to the root
    pub fn relative_path(&self, path: &Path) -> Result<PathBuf> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                VersionError::invalid_path(format!("{:?} is outside space {:?}", path, self.root))
            })
    }

    /// Whether a file name is eligible for capture
    ///
    /// Hidden names, `~`-prefixed names, the control directory and names
    /// matching an exclude pattern are not tracked.
    pub fn is_tracked_name(&self, name: &str) -> bool {
        !name.is_empty()
            && name != CONTROL_DIR
            && !name.starts_with('.')
            && !name.starts_with('~')
            && !self.excludes.is_match(name)
    }

    /// Whether `path` is a trackable location inside this space
    ///
    /// Every component below the root must be a tracked name, so files in
    /// hidden directories or in the control directory are never tracked.
    pub fn is_tracked_path(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let mut any = false;
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    if !self.is_tracked_name(&name.to_string_lossy()) {
                        return false;
                    }
                    any = true;
                }
                _ => return false,
            }
        }
        any
    }
}
