//! Utility functions for verspace
//!
//! This module provides common helpers used throughout the library:
//! content hashing, byte formatting, path manipulation and directory-tree
//! helpers used by space snapshots and usage accounting.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{hash_data, format_bytes};
//!
//! let hash = hash_data(b"Hello, world!");
//! assert_eq!(hash.len(), 64);
//! println!("Size: {}", format_bytes(1536)); // "1.50 KB"
//! ```
//!
//! ## Thread Safety
//!
//! All utility functions are thread-safe and can be called concurrently from
//! multiple threads without synchronization.

use crate::error::{Result, VersionError};
use crate::fs::FileSystem;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Hash arbitrary data using SHA-256
///
/// Returns the digest as a 64-character lowercase hexadecimal string.
/// Same input always produces the same hash.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based). Values below 1024 are whole numbers with
/// "B"; larger values carry two decimals.
///
/// ```rust,ignore
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links keep their own path, and
/// canonicalizes both sides only when that fails.
///
/// # Errors
///
/// - [`VersionError::InvalidPath`] if the path is not under the base path
/// - [`VersionError::Io`] if canonicalization fails
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            VersionError::invalid_path(format!(
                "{:?} is not inside {:?}",
                path_canon, base_canon
            ))
        })
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Totals gathered while copying a tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Regular files copied
    pub files: usize,
    /// Bytes copied
    pub bytes: u64,
}

/// Recursively copy `src` into `dst` through `fs`
///
/// Top-level entries of `src` for which `skip` returns true are left out
/// along with everything below them. Symbolic links are recreated rather
/// than followed. `dst` is created if missing.
///
/// # Errors
///
/// - [`VersionError::WalkDir`] if traversal fails
/// - [`VersionError::Io`] if any copy fails; `dst` may hold a partial copy
pub fn copy_tree(
    fs: &dyn FileSystem,
    src: &Path,
    dst: &Path,
    skip: &dyn Fn(&Path) -> bool,
) -> Result<TreeStats> {
    fs.create_dir_all(dst)?;
    let mut stats = TreeStats::default();

    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && skip(entry.path())));

    for entry in walker {
        let entry = entry?;
        let relative = make_relative(entry.path(), src)?;
        let target = dst.join(&relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs.create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let destination = fs.read_link(entry.path())?;
            fs.symlink(&destination, &target)?;
        } else {
            let copied = fs.copy(entry.path(), &target)?;
            stats.files += 1;
            stats.bytes += copied;
        }
    }

    trace!("Copied {} files ({} bytes) from {:?} to {:?}", stats.files, stats.bytes, src, dst);
    Ok(stats)
}

/// Total size of regular files below `path`
///
/// Entries at depth one for which `skip` returns true are not counted.
/// Unreadable entries are skipped.
pub fn dir_size(path: &Path, skip: &dyn Fn(&Path) -> bool) -> u64 {
    WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && skip(entry.path())))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
