//! Job queue runner service for executing queued tile jobs

use super::job_queue::JobQueue;
use super::types::JobRecord;
use crate::config::JobsConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lower bound on the lease a worker holds on a running job.
const MIN_LEASE: Duration = Duration::from_secs(30);

/// What the queue should do with a job after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Terminal; drop it from the queue.
    Finished,
    /// Run it again once this time has passed.
    RetryAt(DateTime<Utc>),
}

/// Executes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: JobRecord) -> JobOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Running jobs without a heartbeat for this long are re-queued
    pub lease: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
            lease: (config.poll_interval * 10).max(MIN_LEASE),
        }
    }

    fn heartbeat_every(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

#[derive(Clone)]
struct WorkerContext {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    settings: RunnerSettings,
    running: Arc<AtomicUsize>,
}

/// Service responsible for executing jobs from the queue
pub struct JobQueueRunner {
    context: WorkerContext,
}

impl JobQueueRunner {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, settings: RunnerSettings) -> Self {
        Self {
            context: WorkerContext {
                queue,
                handler,
                settings,
                running: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Jobs currently executing in this process.
    pub fn running_count(&self) -> usize {
        self.context.running.load(Ordering::Relaxed)
    }

    /// Run the workers until cancelled.
    ///
    /// On cancellation workers stop claiming, in-flight jobs get
    /// `shutdown_grace` to finish and are then aborted. Aborted jobs keep
    /// their place in the running set and are recovered once their lease
    /// lapses.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let settings = self.context.settings;
        info!(
            "Starting job queue runner service ({} workers, lease {:?})",
            settings.worker_count, settings.lease
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..settings.worker_count {
            let context = self.context.clone();
            let token = cancellation_token.clone();
            workers.spawn(async move { worker_loop(context, worker_id, token).await });
        }

        let mut recovery_check = interval(settings.lease);
        loop {
            tokio::select! {
                _ = recovery_check.tick() => {
                    if let Err(e) = self.context.queue.recover(settings.lease).await {
                        error!("Error recovering abandoned jobs: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Job queue runner received cancellation signal");
                    break;
                }
            }
        }

        self.wait_for_running_jobs_to_complete(&mut workers).await;
        info!("Job queue runner service stopped");
        Ok(())
    }

    async fn wait_for_running_jobs_to_complete(&self, workers: &mut JoinSet<()>) {
        let running = self.running_count();
        if running > 0 {
            info!("Waiting for {} running job(s) to complete...", running);
        }

        let deadline = Instant::now() + self.context.settings.shutdown_grace;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    if joined.is_none() {
                        debug!("All workers stopped");
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Timeout waiting for {} job(s) to complete, aborting them",
                        self.running_count()
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }
}

async fn worker_loop(context: WorkerContext, worker_id: usize, token: CancellationToken) {
    debug!("Worker {} started", worker_id);
    let notify = context.queue.notifier();
    let poll = context.settings.poll_interval;

    while !token.is_cancelled() {
        match context.queue.claim_next().await {
            Ok(Some(job)) => process_job(&context, worker_id, job).await,
            Ok(None) => {
                let wait = match context.queue.next_due_in().await {
                    Ok(Some(due)) => due.min(poll),
                    _ => poll,
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = notify.notified() => {}
                    _ = sleep(wait) => {}
                }
            }
            Err(e) => {
                error!("Worker {} failed to claim a job: {}", worker_id, e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(poll) => {}
                }
            }
        }
    }
    debug!("Worker {} stopped", worker_id);
}

async fn process_job(context: &WorkerContext, worker_id: usize, job: JobRecord) {
    let job_id = job.job_id;
    debug!("Worker {} executing job {} (tile {})", worker_id, job_id, job.tile_id);
    context.running.fetch_add(1, Ordering::Relaxed);

    let execution = context.handler.execute(job);
    tokio::pin!(execution);
    let mut heartbeat = interval(context.settings.heartbeat_every());
    heartbeat.tick().await;

    let outcome = loop {
        tokio::select! {
            outcome = &mut execution => break outcome,
            _ = heartbeat.tick() => {
                if let Err(e) = context.queue.heartbeat(job_id).await {
                    warn!("Failed to refresh lease of job {}: {}", job_id, e);
                }
            }
        }
    };

    let settled = match outcome {
        JobOutcome::Finished => context.queue.complete(job_id).await,
        JobOutcome::RetryAt(at) => context.queue.requeue_at(job_id, at).await,
    };
    if let Err(e) = settled {
        error!("Failed to settle job {} ({:?}): {}", job_id, outcome, e);
    }
    context.running.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::TileJobRequest;
    use crate::state_store::MemoryStateStore;
    use crate::tiles::TileId;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Fails each job once with a retry, then finishes it.
    #[derive(Default)]
    struct FlakyHandler {
        runs: Mutex<HashMap<Uuid, u32>>,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn execute(&self, job: JobRecord) -> JobOutcome {
            let mut runs = self.runs.lock().await;
            let count = runs.entry(job.job_id).or_insert(0);
            *count += 1;
            if *count == 1 {
                JobOutcome::RetryAt(Utc::now())
            } else {
                JobOutcome::Finished
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn execute(&self, _job: JobRecord) -> JobOutcome {
            sleep(Duration::from_secs(3600)).await;
            JobOutcome::Finished
        }
    }

    fn settings() -> RunnerSettings {
        RunnerSettings {
            worker_count: 3,
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(200),
            lease: Duration::from_secs(30),
        }
    }

    fn job(x: i64) -> JobRecord {
        JobRecord::new(
            TileId::new(x, 0),
            &TileJobRequest {
                parcel_id: "p".to_string(),
                lat: 46.9,
                lon: 7.4,
                session_id: "s".to_string(),
                crop_bbox: None,
            },
        )
    }

    #[tokio::test]
    async fn test_workers_drain_queue_including_retries() {
        let queue = JobQueue::new(Arc::new(MemoryStateStore::new()), Duration::from_secs(60));
        for x in 0..5 {
            queue.enqueue(&job(x)).await.unwrap();
        }
        let handler = Arc::new(FlakyHandler::default());
        let runner = Arc::new(JobQueueRunner::new(queue.clone(), handler.clone(), settings()));
        let token = CancellationToken::new();
        let task = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run(token).await })
        };

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = queue.stats().await.unwrap();
                let done = handler.runs.lock().await.values().filter(|c| **c == 2).count();
                if done == 5 && stats.pending == 0 && stats.running == 0 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "queue was not drained");

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_jobs_after_grace() {
        let queue = JobQueue::new(Arc::new(MemoryStateStore::new()), Duration::from_secs(60));
        queue.enqueue(&job(1)).await.unwrap();
        let runner = Arc::new(JobQueueRunner::new(queue.clone(), Arc::new(SlowHandler), settings()));
        let token = CancellationToken::new();
        let task = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run(token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.running_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = Instant::now();
        token.cancel();
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        // The aborted job stays leased until recovery
        assert_eq!(queue.stats().await.unwrap().running, 1);
    }

    #[test]
    fn test_lease_has_a_floor() {
        let settings = RunnerSettings::from_config(&JobsConfig::default());
        assert!(settings.lease >= MIN_LEASE);
        assert!(settings.heartbeat_every() < settings.lease);
    }
}
