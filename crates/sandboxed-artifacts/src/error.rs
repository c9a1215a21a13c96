//! Error types for the artifact sandbox.

use std::path::PathBuf;

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while operating on the artifact sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Relative path was rejected before touching the filesystem
    #[error("Path validation failed: {path:?} - {reason}")]
    PathValidation { path: PathBuf, reason: String },

    /// Artifact does not exist inside the sandbox
    #[error("Artifact not found: {path:?}")]
    NotFound { path: PathBuf },

    /// Directory creation failed
    #[error("Failed to create directory: {path:?} - {source}")]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Permissions error
    #[error("Permission denied: {operation} on {path:?}")]
    Permission { operation: String, path: PathBuf },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl SandboxError {
    /// True when the underlying cause is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            SandboxError::NotFound { .. } => true,
            SandboxError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the underlying cause is an exhausted filesystem.
    pub fn is_storage_full(&self) -> bool {
        match self {
            SandboxError::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}
