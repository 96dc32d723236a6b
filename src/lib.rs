//! # Verspace - per-file version history for directory spaces
//!
//! A library that keeps every saved state of the files in a tracked
//! directory (a *space*) and can put any of them back safely.
//!
//! ## Overview
//!
//! Verspace lets you:
//! - Capture immutable versions of individual files, addressed by UUID and
//!   verified by SHA-256
//! - Restore a file to any earlier version, with a safety version of the
//!   current content taken first and automatic rollback on failure
//! - Copy a whole space into a space version and restore it transactionally
//! - Watch a space and capture changed files automatically, degrading to
//!   polling when native notifications misbehave
//! - Bound storage with size, age or count policies
//! - Compare versions line by line
//!
//! ## On-disk layout
//!
//! Everything lives in a hidden control directory at the space root:
//!
//! ```text
//! <space>/.control/metadata.json
//! <space>/.control/file_versions/<sha256(path)>/<versionId>.blob
//! <space>/.control/file_metadata/<sha256(path)>/<versionId>.json
//! <space>/.control/space_versions/<versionId>/...
//! <space>/.control/space_metadata/<versionId>.json
//! <space>/.control/tmp/
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use verspace::VersionKeeper;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keeper = VersionKeeper::new();
//! let space = keeper.create_space(Path::new("./docs"))?;
//!
//! let file = Path::new("./docs/plan.md");
//! let version = keeper.capture(&space, file, Some("first draft".to_string()))?;
//!
//! // ...edit the file...
//!
//! let result = keeper.restore(&space, file, &version.short_id(), None)?;
//! println!("Restored {} bytes in {}ms", result.bytes_written, result.duration_ms);
//! # Ok(())
//! # }
//! ```
//!
//! ## Automatic captures
//!
//! ```rust,no_run
//! # use verspace::VersionKeeper;
//! # use std::path::Path;
//! # use std::sync::Arc;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let keeper = VersionKeeper::new();
//! # let space = keeper.open_space(Path::new("./docs"))?;
//! keeper.start_monitoring(&space, Arc::new(|event| {
//!     println!("{:?} {:?}", event.kind, event.path);
//! }))?;
//! // ...
//! keeper.stop_monitoring(&space);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Captures of one path are serialized by a per-path lock; different paths
//! proceed in parallel. A file restore excludes captures of that path for its
//! duration, and a space restore excludes every file operation in the space.
//! All components built by one [`VersionKeeper`] share the same lock table.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`](error::Result) with a [`VersionError`].
//! [`VersionError::RollbackFailed`] is the one outcome that means live data
//! may be inconsistent; it carries the location of the preserved backup.
//!
//! ## Module Organization
//!
//! - [`keeper`]: Service facade and builder
//! - [`space`]: Space creation, opening and path rules
//! - [`store`]: File version capture, lookup and deletion
//! - [`metadata`]: Durable JSON version records
//! - [`restore`]: File and space restore with rollback
//! - [`snapshot`]: Whole-space versions
//! - [`monitor`]: Change monitoring and throttled captures
//! - [`retention`]: Storage usage and policies
//! - [`diff`]: Line diffs between versions
//! - [`fs`]: Filesystem abstraction and atomic writes
//! - [`types`]: Common types and data structures
//! - [`error`]: Error types and handling

// Public API modules
pub mod diff;
pub mod error;
pub mod fs;
pub mod keeper;
pub mod metadata;
pub mod monitor;
pub mod restore;
pub mod retention;
pub mod snapshot;
pub mod space;
pub mod store;
pub mod types;

// Internal modules
mod utils;

// Re-exports for convenience
pub use error::{Result, VersionError};
pub use fs::{FileSystem, StdFileSystem};
pub use keeper::{VersionKeeper, VersionKeeperBuilder};
pub use monitor::{ChangeMonitor, EventAnomaly, MonitorStats};
pub use retention::RetentionEnforcer;
pub use space::Space;
pub use store::VersionStore;
pub use types::*;
pub use utils::format_bytes;
