//! Error type definitions for the point-cloud proxy

use sandboxed_artifacts::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Artifact sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Shared key/value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database errors from SeaORM
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Cache metadata or artifact failures
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache metadata error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache artifact error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl From<CacheError> for AppError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Store(e) => Self::Store(e),
            CacheError::Sandbox(e) => Self::Sandbox(e),
        }
    }
}

/// How a pipeline failure is handled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccups; retried within the attempt budget
    Transient,
    /// Bad coordinates, bad crop bounds, bad upstream data; never retried
    PermanentInput,
    /// Misconfiguration such as a missing converter or a full disk; never retried
    Environment,
    /// A step reported success but its output is not there
    InternalConsistency,
}

/// Failures raised while fetching or converting a tile.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Timed out during {operation} after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Upstream {url} answered HTTP {status}")]
    UpstreamStatus { url: String, status: u16 },

    #[error("Malformed upstream response from {url}: {message}")]
    MalformedResponse { url: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Crop bounds do not intersect tile {tile_id}")]
    CropOutsideTile { tile_id: String },

    #[error("Converter executable '{command}' not found")]
    ConverterMissing { command: String },

    #[error("Converter exited with {}: {output}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ConverterFailed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Converter finished but {path:?} is missing")]
    MissingDescriptor { path: PathBuf },

    #[error("Insufficient disk space at {path:?}: {message}")]
    DiskFull { path: PathBuf, message: String },

    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact sandbox error: {0}")]
    Sandbox(SandboxError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job exceeded its time budget of {after:?}")]
    JobTimeout { after: Duration },
}

impl PipelineError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap an I/O error, recognising an exhausted filesystem.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error, path: &std::path::Path) -> Self {
        if source.kind() == std::io::ErrorKind::StorageFull {
            return Self::DiskFull {
                path: path.to_path_buf(),
                message: source.to_string(),
            };
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Store(_) => ErrorClass::Transient,
            Self::UpstreamStatus { status, .. } => {
                if *status == 429 || *status >= 500 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::PermanentInput
                }
            }
            Self::MalformedResponse { .. }
            | Self::InvalidInput { .. }
            | Self::CropOutsideTile { .. }
            | Self::ConverterFailed { .. } => ErrorClass::PermanentInput,
            Self::ConverterMissing { .. }
            | Self::DiskFull { .. }
            | Self::Io { .. }
            | Self::Sandbox(_) => ErrorClass::Environment,
            Self::MissingDescriptor { .. } => ErrorClass::InternalConsistency,
            Self::JobTimeout { .. } => ErrorClass::Transient,
        }
    }

    /// Whether the orchestrator may try the job again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient && !matches!(self, Self::JobTimeout { .. })
    }

    /// Message shown to clients in the job status.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => {
                "The elevation data service could not be reached".to_string()
            }
            Self::UpstreamStatus { status, .. } if *status == 404 => {
                "No point-cloud data is published for this tile".to_string()
            }
            Self::UpstreamStatus { status, .. } => {
                format!("The elevation data service answered with HTTP {status}")
            }
            Self::MalformedResponse { .. } => {
                "The elevation data service returned unusable data".to_string()
            }
            Self::InvalidInput { message } => format!("Invalid request: {message}"),
            Self::CropOutsideTile { .. } => {
                "The requested crop area lies outside the tile".to_string()
            }
            Self::ConverterMissing { .. } | Self::Io { .. } | Self::Sandbox(_) => {
                "The conversion service is misconfigured".to_string()
            }
            Self::ConverterFailed { .. } => "The point cloud could not be converted".to_string(),
            Self::MissingDescriptor { .. } => {
                "The conversion finished without producing output".to_string()
            }
            Self::DiskFull { .. } => "The tile cache is out of disk space".to_string(),
            Self::Store(_) => "The job state store is unavailable".to_string(),
            Self::JobTimeout { .. } => "Processing took too long and was aborted".to_string(),
        }
    }
}

impl From<SandboxError> for PipelineError {
    fn from(error: SandboxError) -> Self {
        if error.is_storage_full() {
            return Self::DiskFull {
                path: PathBuf::new(),
                message: error.to_string(),
            };
        }
        match error {
            SandboxError::PathValidation { reason, .. } => Self::InvalidInput { message: reason },
            other => Self::Sandbox(other),
        }
    }
}

impl From<CacheError> for PipelineError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Store(e) => Self::Store(e),
            CacheError::Sandbox(e) => e.into(),
        }
    }
}
