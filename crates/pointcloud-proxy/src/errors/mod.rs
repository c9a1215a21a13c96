//! Centralized error handling for the point-cloud proxy
//!
//! # Error Categories
//!
//! - **AppError**: request-boundary errors mapped onto HTTP responses
//! - **StoreError**: shared key/value store failures (SeaORM or in-memory)
//! - **CacheError**: cache metadata or artifact failures
//! - **PipelineError**: fetch/convert failures, each carrying an [`ErrorClass`]
//!   that decides between retrying and failing the job
//!
//! Pipeline errors never cross the orchestrator boundary: they are turned
//! into a job status and a human-readable message there.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for store Results
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience type alias for cache Results
pub type CacheResult<T> = Result<T, CacheError>;

/// Convenience type alias for pipeline Results
pub type PipelineResult<T> = Result<T, PipelineError>;
