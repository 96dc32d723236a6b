//! Filesystem abstraction used by the store, index and restore paths
//!
//! All reads and writes of version data, metadata records and live files go
//! through [`FileSystem`]. Production code uses [`StdFileSystem`]; tests swap
//! in implementations that fail specific operations to exercise rollback.
//!
//! ## Atomic writes
//!
//! [`atomic_write`] writes to a uniquely named hidden sibling and renames it
//! over the target. Readers observe either the old content or the new
//! content, never a prefix of the new content. The sibling is hidden so the
//! change monitor never captures it.

use crate::error::Result;
use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;
use uuid::Uuid;

/// Operations the library needs from a filesystem
pub trait FileSystem: Send + Sync + Debug {
    /// Read the full contents of a file
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create or truncate a file and write `contents`
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Rename `from` to `to`, replacing `to` if it exists
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory and everything below it
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create a directory and all missing parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// List the entries of a directory
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Whether anything exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Metadata of the entry at `path`, without following symlinks
    fn metadata(&self, path: &Path) -> io::Result<fs::Metadata>;

    /// Replace the permissions of the file at `path`
    fn set_permissions(&self, path: &Path, permissions: fs::Permissions) -> io::Result<()>;

    /// Copy a regular file with its permissions, returning the bytes copied
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Target of the symbolic link at `path`
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create a symbolic link at `link` pointing to `original`
    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()>;
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn metadata(&self, path: &Path) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(path)
    }

    fn set_permissions(&self, path: &Path, permissions: fs::Permissions) -> io::Result<()> {
        fs::set_permissions(path, permissions)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    #[cfg(unix)]
    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(original, link)
    }

    #[cfg(windows)]
    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        use std::os::windows::fs::{symlink_dir, symlink_file};
        let resolved = match link.parent() {
            Some(parent) => parent.join(original),
            None => original.to_path_buf(),
        };
        if resolved.is_dir() {
            symlink_dir(original, link)
        } else {
            symlink_file(original, link)
        }
    }
}

/// Sibling path used while writing `path`
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_name = format!(".{}.{}.tmp", name, Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Atomic file write (write to temp file then rename)
///
/// When `path` is an existing regular file its permissions carry over to the
/// new content. The temp file is removed on failure, and `path` is left as
/// it was.
///
/// # Errors
///
/// - [`VersionError::Io`](crate::VersionError::Io) if the write, permission
///   copy or rename fails
pub fn atomic_write(fs: &dyn FileSystem, path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path);
    let permissions = fs
        .metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.permissions());

    let written = fs.write(&temp_path, content).and_then(|()| match permissions {
        Some(permissions) => fs.set_permissions(&temp_path, permissions),
        None => Ok(()),
    });
    if let Err(e) = written {
        let _ = fs.remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = fs.rename(&temp_path, path) {
        let _ = fs.remove_file(&temp_path);
        return Err(e.into());
    }

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}
