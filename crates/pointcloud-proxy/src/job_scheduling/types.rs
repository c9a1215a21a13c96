//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, ErrorClass, StoreError};
use crate::tiles::{ProjectedBounds, TileId};

/// Lifecycle of a tile job.
///
/// `pending → processing → {ready, error}`; a job may also go straight from
/// `pending` to a terminal state (cache hit, or rejected before any work).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Error)
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// Staying in the same non-terminal status is allowed so that progress
    /// updates can be recorded without a status change.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => true,
            JobStatus::Processing => next != JobStatus::Pending,
            JobStatus::Ready | JobStatus::Error => false,
        }
    }
}

/// What a client asks for when submitting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TileJobRequest {
    /// Caller's parcel or request identifier, echoed in logs and status
    pub parcel_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Scope of the progress channel
    pub session_id: String,
    /// Optional crop window in projected metres
    #[serde(default)]
    pub crop_bbox: Option<ProjectedBounds>,
}

/// Durable job state, stored under `job:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub tile_id: TileId,
    pub session_id: String,
    pub parcel_id: String,
    #[serde(default)]
    pub crop_bbox: Option<ProjectedBounds>,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    #[serde(default)]
    pub result_url: Option<String>,
    /// Attempts started so far
    pub attempts: u32,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the first attempt started; the job time budget counts from here
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(tile_id: TileId, request: &TileJobRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            tile_id,
            session_id: request.session_id.clone(),
            parcel_id: request.parcel_id.clone(),
            crop_bbox: request.crop_bbox,
            status: JobStatus::Pending,
            progress: 0.0,
            message: "Queued".to_string(),
            result_url: None,
            attempts: 0,
            error_class: None,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    /// Move to `next`, refusing to leave a terminal state.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobSchedulingError> {
        if !self.status.can_transition_to(next) {
            return Err(JobSchedulingError::InvalidTransition {
                job_id: self.job_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Errors that can occur in the job scheduling system
#[derive(Debug, thiserror::Error)]
pub enum JobSchedulingError {
    /// Attempted to leave a terminal status or go backwards
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Job record expired or never existed
    #[error("Job {job_id} not found")]
    NotFound { job_id: Uuid },

    /// Shared store operation failed
    #[error("Job store operation failed: {0}")]
    Store(#[from] StoreError),
}

impl From<JobSchedulingError> for AppError {
    fn from(error: JobSchedulingError) -> Self {
        match error {
            JobSchedulingError::NotFound { job_id } => AppError::not_found("job", job_id.to_string()),
            JobSchedulingError::Store(e) => AppError::Store(e),
            other => AppError::internal(other.to_string()),
        }
    }
}
