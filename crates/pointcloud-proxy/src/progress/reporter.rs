//! Per-job progress publisher with a monotonic clamp.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{ProgressChannel, ProgressEvent, ProgressSink};
use crate::job_scheduling::{JobRecord, JobStatus};

/// Smallest progress step worth publishing when the message is unchanged.
const MIN_STEP: f64 = 0.5;

#[derive(Debug)]
struct Published {
    status: JobStatus,
    progress: f64,
    message: String,
}

/// Publishes the updates of one job.
///
/// While the job is processing, published progress never goes down; lower
/// values are raised to the last published one. Tiny steps with an unchanged
/// message are dropped to keep store writes bounded.
#[derive(Debug)]
pub struct ProgressReporter {
    channel: Arc<ProgressChannel>,
    job_id: Uuid,
    tile_id: String,
    session_id: String,
    last: Mutex<Published>,
}

impl ProgressReporter {
    pub fn new(channel: Arc<ProgressChannel>, record: &JobRecord) -> Self {
        Self {
            channel,
            job_id: record.job_id,
            tile_id: record.tile_id.to_string(),
            session_id: record.session_id.clone(),
            last: Mutex::new(Published {
                status: record.status,
                progress: record.progress,
                message: record.message.clone(),
            }),
        }
    }

    pub async fn progress(&self) -> f64 {
        self.last.lock().await.progress
    }

    /// Publish a status change, or a progress step within `processing`.
    ///
    /// Returns the progress actually published.
    pub async fn update(
        &self,
        status: JobStatus,
        progress: f64,
        message: &str,
        result_url: Option<String>,
    ) -> f64 {
        let mut last = self.last.lock().await;
        let progress = if progress.is_finite() {
            round(progress.clamp(0.0, 100.0))
        } else {
            last.progress
        };
        let progress = match status {
            JobStatus::Processing | JobStatus::Pending => progress.max(last.progress),
            JobStatus::Ready => 100.0,
            JobStatus::Error => last.progress,
        };

        let event = ProgressEvent {
            job_id: self.job_id,
            tile_id: self.tile_id.clone(),
            status,
            progress,
            message: message.to_string(),
            result_url,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.channel.publish(&self.session_id, event).await {
            warn!("Failed to publish progress of job {}: {}", self.job_id, e);
        }

        *last = Published {
            status,
            progress,
            message: message.to_string(),
        };
        progress
    }
}

fn round(progress: f64) -> f64 {
    (progress * 10.0).round() / 10.0
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn report(&self, percent: f64, message: &str) {
        {
            let last = self.last.lock().await;
            if last.status.is_terminal() {
                return;
            }
            let step = round(percent.clamp(0.0, 100.0)) - last.progress;
            if step < MIN_STEP && last.message == message && percent < 100.0 {
                return;
            }
        }
        self.update(JobStatus::Processing, percent, message, None)
            .await;
    }
}
