//! Error types for the verspace library
//!
//! This module defines every error that can surface from capture, restore,
//! monitoring, and retention operations. The first five variants form the
//! core taxonomy callers are expected to branch on; the rest wrap ambient
//! failures (I/O, serialization, configuration).

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the verspace library
pub type Result<T> = std::result::Result<T, VersionError>;

/// Main error type for all verspace operations
#[derive(Debug, Error)]
pub enum VersionError {
    /// Missing or unreadable file, or a path outside any tracked space
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Unknown version identifier, or a version that belongs to another path
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Unparseable metadata record or a blob whose hash does not match
    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    /// A restore write or verification step failed; the live data was rolled back
    #[error("Restoration failed: {0}")]
    RestorationFailed(String),

    /// Recovery after a failed restore also failed; live data may be inconsistent
    #[error("Rollback failed: {message}")]
    RollbackFailed {
        /// What went wrong during recovery
        message: String,
        /// Preserved copy of the pre-restore state, if one survived
        backup: Option<PathBuf>,
    },

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Directory has no control subtree
    #[error("Space not initialized at path: {0:?}")]
    SpaceNotInitialized(PathBuf),

    /// Directory is already tracked
    #[error("Space already exists at path: {0:?}")]
    SpaceAlreadyExists(PathBuf),

    /// A metadata record with this identifier is already on disk
    #[error("Version {0} already recorded")]
    DuplicateVersion(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Exclude pattern failed to compile
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for VersionError {
    fn from(err: globset::Error) -> Self {
        VersionError::InvalidPattern(err.to_string())
    }
}

impl VersionError {
    /// Create an invalid path error with a custom message
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        VersionError::InvalidPath(msg.into())
    }

    /// Create an invalid version error with a custom message
    pub fn invalid_version(msg: impl Into<String>) -> Self {
        VersionError::InvalidVersion(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        VersionError::MetadataCorrupted(msg.into())
    }

    /// Create a restoration error with a custom message
    pub fn restoration(msg: impl Into<String>) -> Self {
        VersionError::RestorationFailed(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VersionError::Internal(msg.into())
    }

    /// Check if this error indicates corrupted on-disk state
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VersionError::MetadataCorrupted(_) | VersionError::Json(_)
        )
    }

    /// Check if this error means live data may be inconsistent
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, VersionError::RollbackFailed { .. })
    }

    /// Check if retrying the operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            VersionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            VersionError::RestorationFailed(_) => true,
            _ => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            VersionError::InvalidPath(msg) => {
                format!("{}. Check that the file exists and lives inside a tracked space.", msg)
            }
            VersionError::InvalidVersion(msg) => {
                format!("{}. List the file's versions to see valid identifiers.", msg)
            }
            VersionError::MetadataCorrupted(msg) => {
                format!("Stored version data is damaged: {}", msg)
            }
            VersionError::RestorationFailed(msg) => {
                format!("Restore did not complete and the file was left unchanged: {}", msg)
            }
            VersionError::RollbackFailed { message, backup } => match backup {
                Some(path) => format!(
                    "Restore failed and the original content could not be put back ({}). \
                     A copy of the previous state is preserved at {:?}.",
                    message, path
                ),
                None => format!(
                    "Restore failed and the original content could not be put back ({}). \
                     The file may be inconsistent.",
                    message
                ),
            },
            VersionError::SpaceNotInitialized(path) => {
                format!("{:?} is not a tracked space. Run 'verspace init' first.", path)
            }
            _ => self.to_string(),
        }
    }
}
