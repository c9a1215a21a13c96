//! Tile job orchestration
//!
//! Accepts job submissions, answers status and availability queries, and
//! executes claimed jobs: cache check, tile lock, fetch, convert, retry or
//! fail. Every state change is written to the job record and published on
//! the progress channel.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStore};
use crate::errors::{AppError, AppResult, ErrorClass, PipelineError, PipelineResult};
use crate::job_scheduling::{
    Claim, DedupRegistry, JobHandler, JobOutcome, JobQueue, JobRecord, JobSchedulingError,
    JobStatus, RetryPolicy, TileJobRequest,
};
use crate::pipeline::converter::effective_crop;
use crate::pipeline::{Converter, Fetcher};
use crate::progress::{ProgressChannel, ProgressEvent, ProgressReporter, ScaledProgress};
use crate::tiles::{Tile, TileGrid, TileId};

/// Share of the progress bar given to the download.
const FETCH_SPAN: (f64, f64) = (0.0, 70.0);
/// Share of the progress bar given to the conversion.
const CONVERT_SPAN: (f64, f64) = (70.0, 100.0);
/// How often a job waiting on another job's tile looks again.
const TILE_WAIT_POLL: Duration = Duration::from_secs(1);
/// Delay before re-running a job whose state could not be stored.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Attempts at replacing a stale dedup claim before giving up.
const CLAIM_ATTEMPTS: usize = 3;
const MAX_ID_LEN: usize = 256;

/// The two pipeline steps.
#[derive(Clone)]
pub struct TilePipeline {
    pub fetcher: Arc<dyn Fetcher>,
    pub converter: Arc<dyn Converter>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// Wall-clock budget of a job, counted from its first attempt
    pub job_timeout: Duration,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    #[schema(value_type = String, example = "2600_1199")]
    pub tile_id: TileId,
    pub status: JobStatus,
    /// The session already had a live job for this tile
    pub deduplicated: bool,
}

/// What is known about a tile without starting any work.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TileAvailability {
    #[schema(value_type = String, example = "2600_1199")]
    pub tile_id: TileId,
    pub coverage_available: bool,
    pub raw_cached: bool,
    pub converted_cached: bool,
}

pub struct JobOrchestrator {
    grid: TileGrid,
    cache: CacheStore,
    queue: JobQueue,
    registry: DedupRegistry,
    progress: Arc<ProgressChannel>,
    pipeline: TilePipeline,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        grid: TileGrid,
        cache: CacheStore,
        queue: JobQueue,
        registry: DedupRegistry,
        progress: Arc<ProgressChannel>,
        pipeline: TilePipeline,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            grid,
            cache,
            queue,
            registry,
            progress,
            pipeline,
            settings,
        }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    /// Accept a job for the tile containing the requested point.
    ///
    /// A tile that is already converted yields a job that is ready at once.
    /// A session that still has a live job for the tile gets that job back.
    pub async fn submit(&self, request: TileJobRequest) -> AppResult<SubmitOutcome> {
        let tile = self.validate(&request)?;
        let tile_id = tile.tile_id;

        if self.cached_ready(&tile_id).await.is_some() {
            let mut job = JobRecord::new(tile_id, &request);
            job.transition(JobStatus::Ready)?;
            job.progress = 100.0;
            job.message = "Ready (served from cache)".to_string();
            job.result_url = Some(result_url(&tile_id));
            self.queue.save(&job).await?;
            self.cache.touch(&tile_id).await?;
            self.progress
                .publish(&job.session_id, ProgressEvent::from_record(&job))
                .await?;
            info!("Job {} for tile {} served from cache", job.job_id, tile_id);
            return Ok(SubmitOutcome {
                job_id: job.job_id,
                tile_id,
                status: JobStatus::Ready,
                deduplicated: false,
            });
        }

        let job = JobRecord::new(tile_id, &request);
        for _ in 0..CLAIM_ATTEMPTS {
            match self
                .registry
                .claim(&request.session_id, &tile_id, job.job_id)
                .await?
            {
                Claim::Won => {
                    if let Err(e) = self.queue.enqueue(&job).await {
                        self.release_claim(&job).await;
                        return Err(e.into());
                    }
                    self.progress
                        .publish(&job.session_id, ProgressEvent::from_record(&job))
                        .await?;
                    info!(
                        "Queued job {} for tile {} (parcel {}, session {})",
                        job.job_id, tile_id, job.parcel_id, job.session_id
                    );
                    return Ok(SubmitOutcome {
                        job_id: job.job_id,
                        tile_id,
                        status: JobStatus::Pending,
                        deduplicated: false,
                    });
                }
                Claim::Held(existing) => match self.queue.load(existing).await? {
                    Some(live) if !live.status.is_terminal() => {
                        debug!(
                            "Session {} already has job {} for tile {}",
                            request.session_id, existing, tile_id
                        );
                        return Ok(SubmitOutcome {
                            job_id: existing,
                            tile_id,
                            status: live.status,
                            deduplicated: true,
                        });
                    }
                    _ => {
                        debug!("Replacing stale dedup claim of job {}", existing);
                        self.registry
                            .release(&request.session_id, &tile_id, existing)
                            .await?;
                    }
                },
            }
        }
        Err(AppError::internal(format!(
            "Could not register a job for tile {tile_id}"
        )))
    }

    /// Latest known state of a job.
    pub async fn status(&self, job_id: Uuid) -> AppResult<ProgressEvent> {
        if let Some(event) = self.progress.last_event(job_id).await? {
            return Ok(event);
        }
        match self.queue.load(job_id).await? {
            Some(job) => {
                let mut event = ProgressEvent::from_record(&job);
                event.timestamp = job.updated_at;
                Ok(event)
            }
            None => Err(AppError::not_found("job", job_id.to_string())),
        }
    }

    /// Cache state of the tile containing a point. Cached tiles count as used.
    pub async fn availability(&self, lat: f64, lon: f64) -> AppResult<TileAvailability> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(AppError::validation("lat and lon must be finite numbers"));
        }
        let tile_id = self.grid.tile_for_point(lat, lon).tile_id;
        if !self.grid.in_region(lat, lon) {
            return Ok(TileAvailability {
                tile_id,
                coverage_available: false,
                raw_cached: false,
                converted_cached: false,
            });
        }

        let tiers = self.cache.tier_status(&tile_id).await?;
        if tiers.raw_cached || tiers.converted_cached {
            self.cache.touch(&tile_id).await?;
        }
        Ok(TileAvailability {
            tile_id,
            coverage_available: true,
            raw_cached: tiers.raw_cached,
            converted_cached: tiers.converted_cached,
        })
    }

    fn validate(&self, request: &TileJobRequest) -> AppResult<Tile> {
        validate_id("session_id", &request.session_id)?;
        validate_id("parcel_id", &request.parcel_id)?;
        if !request.lat.is_finite() || !request.lon.is_finite() {
            return Err(AppError::validation("lat and lon must be finite numbers"));
        }
        if !self.grid.in_region(request.lat, request.lon) {
            return Err(AppError::validation(format!(
                "({}, {}) is outside the supported region",
                request.lat, request.lon
            )));
        }
        let tile = self.grid.tile_for_point(request.lat, request.lon);
        if let Some(crop) = &request.crop_bbox {
            effective_crop(&tile, crop, 0.0)
                .map_err(|e| AppError::validation(e.user_message()))?;
        }
        Ok(tile)
    }

    async fn cached_ready(&self, tile_id: &TileId) -> Option<CacheEntry> {
        match self.cache.lookup_ready(tile_id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache lookup for {} failed: {}", tile_id, e);
                None
            }
        }
    }

    async fn release_claim(&self, job: &JobRecord) {
        if let Err(e) = self
            .registry
            .release(&job.session_id, &job.tile_id, job.job_id)
            .await
        {
            warn!("Failed to release dedup claim of job {}: {}", job.job_id, e);
        }
    }

    async fn unlock_tile(&self, tile_id: &TileId, job_id: Uuid) {
        if let Err(e) = self.registry.unlock_tile(tile_id, job_id).await {
            warn!("Failed to unlock tile {} held by job {}: {}", tile_id, job_id, e);
        }
    }

    async fn execute_job(&self, mut job: JobRecord) -> Result<JobOutcome, JobSchedulingError> {
        if job.status.is_terminal() {
            self.release_claim(&job).await;
            return Ok(JobOutcome::Finished);
        }

        let tile = self.grid.tile_for_id(&job.tile_id);
        let reporter = ProgressReporter::new(self.progress.clone(), &job);

        if self.cached_ready(&tile.tile_id).await.is_some() {
            self.finish_ready(&mut job, &reporter, "Ready (served from cache)")
                .await?;
            return Ok(JobOutcome::Finished);
        }

        match self.registry.lock_tile(&tile.tile_id, job.job_id).await? {
            Claim::Won => {}
            Claim::Held(holder) if holder == job.job_id => {}
            Claim::Held(holder) => return self.wait_for_tile(&mut job, &reporter, holder).await,
        }

        job.attempts += 1;
        let started_at = *job.started_at.get_or_insert_with(Utc::now);
        job.transition(JobStatus::Processing)?;
        job.message = format!(
            "Processing (attempt {}/{})",
            job.attempts,
            self.settings.retry.max_attempts()
        );
        self.queue.save(&job).await?;
        reporter
            .update(JobStatus::Processing, job.progress, &job.message, None)
            .await;

        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        let remaining = self.settings.job_timeout.saturating_sub(elapsed);
        let result = match tokio::time::timeout(remaining, self.run_pipeline(&tile, &job, &reporter))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::JobTimeout {
                after: self.settings.job_timeout,
            }),
        };
        self.unlock_tile(&tile.tile_id, job.job_id).await;

        match result {
            Ok(entry) => {
                info!(
                    "Job {} prepared tile {} ({} bytes raw, {} bytes converted)",
                    job.job_id,
                    tile.tile_id,
                    entry.raw.size_bytes,
                    entry.converted.as_ref().map_or(0, |c| c.size_bytes)
                );
                self.finish_ready(&mut job, &reporter, "Ready").await?;
                Ok(JobOutcome::Finished)
            }
            Err(error) => self.handle_failure(&mut job, &reporter, error).await,
        }
    }

    async fn run_pipeline(
        &self,
        tile: &Tile,
        job: &JobRecord,
        reporter: &ProgressReporter,
    ) -> PipelineResult<CacheEntry> {
        if let Some(crop) = &job.crop_bbox {
            effective_crop(tile, crop, 0.0)?;
        }
        self.cache.discard_partial(&tile.tile_id).await?;

        let fetch_progress = ScaledProgress::new(reporter, FETCH_SPAN.0, FETCH_SPAN.1);
        let raw = self
            .pipeline
            .fetcher
            .fetch(
                tile,
                self.cache.sandbox(),
                &self.cache.raw_artifact(&tile.tile_id),
                &fetch_progress,
            )
            .await?;
        self.cache.record_from_disk(&tile.tile_id).await?;

        let output_dir = self.cache.converted_dir_path(&tile.tile_id)?;
        let convert_progress = ScaledProgress::new(reporter, CONVERT_SPAN.0, CONVERT_SPAN.1);
        self.pipeline
            .converter
            .convert(
                tile,
                &raw,
                &output_dir,
                &convert_progress,
                job.crop_bbox.as_ref(),
            )
            .await?;

        match self.cache.record_from_disk(&tile.tile_id).await? {
            Some(entry) if entry.is_converted() => Ok(entry),
            _ => Err(PipelineError::MissingDescriptor {
                path: output_dir.join(self.cache.descriptor_file()),
            }),
        }
    }

    async fn wait_for_tile(
        &self,
        job: &mut JobRecord,
        reporter: &ProgressReporter,
        holder: Uuid,
    ) -> Result<JobOutcome, JobSchedulingError> {
        let message = format!("Waiting for tile {} to be prepared by another request", job.tile_id);
        if job.message != message {
            debug!("Job {} waits for job {} on tile {}", job.job_id, holder, job.tile_id);
            job.message = message;
            job.updated_at = Utc::now();
            self.queue.save(job).await?;
            reporter
                .update(job.status, job.progress, &job.message, None)
                .await;
        }
        Ok(JobOutcome::RetryAt(Utc::now() + to_chrono(TILE_WAIT_POLL)))
    }

    async fn finish_ready(
        &self,
        job: &mut JobRecord,
        reporter: &ProgressReporter,
        message: &str,
    ) -> Result<(), JobSchedulingError> {
        let url = result_url(&job.tile_id);
        job.transition(JobStatus::Ready)?;
        job.progress = 100.0;
        job.message = message.to_string();
        job.result_url = Some(url.clone());
        job.error_class = None;
        self.queue.save(job).await?;
        reporter
            .update(JobStatus::Ready, 100.0, message, Some(url))
            .await;
        self.release_claim(job).await;
        if let Err(e) = self.cache.touch(&job.tile_id).await {
            warn!("Failed to touch cached tile {}: {}", job.tile_id, e);
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        job: &mut JobRecord,
        reporter: &ProgressReporter,
        error: PipelineError,
    ) -> Result<JobOutcome, JobSchedulingError> {
        let class = error.class();
        if let Err(e) = self.cache.discard_partial(&job.tile_id).await {
            warn!("Failed to discard partial artifacts of {}: {}", job.tile_id, e);
        }
        if matches!(
            error,
            PipelineError::ConverterFailed { .. } | PipelineError::MissingDescriptor { .. }
        ) {
            if let Err(e) = self.cache.discard_raw(&job.tile_id).await {
                warn!("Failed to discard raw artifact of {}: {}", job.tile_id, e);
            }
        }

        let max_attempts = self.settings.retry.max_attempts();
        if self.settings.retry.should_retry(job.attempts, &error) {
            let delay = self.settings.retry.delay_for(job.attempts);
            warn!(
                error_class = %class,
                "Job {} attempt {}/{} failed, retrying in {:?}: {}",
                job.job_id, job.attempts, max_attempts, delay, error
            );
            job.message = format!(
                "{} (retrying in {}s, attempt {}/{})",
                error.user_message(),
                delay.as_secs().max(1),
                job.attempts,
                max_attempts
            );
            job.progress = reporter.progress().await;
            job.updated_at = Utc::now();
            self.queue.save(job).await?;
            reporter
                .update(JobStatus::Processing, job.progress, &job.message, None)
                .await;
            return Ok(JobOutcome::RetryAt(Utc::now() + to_chrono(delay)));
        }

        match class {
            ErrorClass::Environment | ErrorClass::InternalConsistency => error!(
                error_class = %class,
                "Job {} for tile {} failed: {}", job.job_id, job.tile_id, error
            ),
            ErrorClass::Transient | ErrorClass::PermanentInput => warn!(
                error_class = %class,
                "Job {} for tile {} failed: {}", job.job_id, job.tile_id, error
            ),
        }

        job.transition(JobStatus::Error)?;
        job.error_class = Some(class);
        job.progress = reporter.progress().await;
        job.message = if class == ErrorClass::Transient && job.attempts > 1 {
            format!(
                "{} (gave up after {} attempts)",
                error.user_message(),
                job.attempts
            )
        } else {
            error.user_message()
        };
        self.queue.save(job).await?;
        reporter
            .update(JobStatus::Error, job.progress, &job.message, None)
            .await;
        self.release_claim(job).await;
        Ok(JobOutcome::Finished)
    }
}

#[async_trait]
impl JobHandler for JobOrchestrator {
    async fn execute(&self, job: JobRecord) -> JobOutcome {
        let job_id = job.job_id;
        match self.execute_job(job).await {
            Ok(outcome) => outcome,
            Err(e @ JobSchedulingError::InvalidTransition { .. }) => {
                warn!("Dropping job {}: {}", job_id, e);
                JobOutcome::Finished
            }
            Err(e) => {
                error!("Job {} could not be processed, will retry: {}", job_id, e);
                JobOutcome::RetryAt(Utc::now() + to_chrono(STORE_RETRY_DELAY))
            }
        }
    }
}

/// Where a ready tile is served.
pub fn result_url(tile_id: &TileId) -> String {
    format!("/tiles/{tile_id}/")
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn validate_id(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(AppError::validation(format!(
            "{field} must be at most {MAX_ID_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(AppError::validation(format!(
            "{field} cannot contain control characters"
        )));
    }
    Ok(())
}
