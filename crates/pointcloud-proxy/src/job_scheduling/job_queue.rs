//! Durable job queue kept in the shared state store.
//!
//! Records live under `job:{id}`. `jobs:pending` holds queued job ids scored
//! by the time they become due (ms since epoch); `jobs:running` holds claimed
//! ids scored by the claimant's last heartbeat. A job is owned by whichever
//! worker removes it from `jobs:pending`, which is a single atomic delete in
//! every backend, so several workers and several processes can share the
//! queue. Jobs whose heartbeat goes stale are put back by [`JobQueue::recover`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::types::{JobRecord, JobSchedulingError};
use crate::state_store::{StateStore, get_json, now_millis, set_json};

const JOB_PREFIX: &str = "job:";
const PENDING_SET: &str = "jobs:pending";
const RUNNING_SET: &str = "jobs:running";
/// Due jobs inspected per claim attempt.
const CLAIM_BATCH: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
}

/// Thread-safe, store-backed job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn StateStore>,
    record_ttl: Duration,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StateStore>, record_ttl: Duration) -> Self {
        Self {
            store,
            record_ttl,
            notify: Arc::new(Notify::new()),
        }
    }

    fn record_key(job_id: Uuid) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    /// Signalled whenever a job is enqueued in this process.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Store a job record, refreshing its expiry.
    pub async fn save(&self, record: &JobRecord) -> Result<(), JobSchedulingError> {
        set_json(
            self.store.as_ref(),
            &Self::record_key(record.job_id),
            record,
            Some(self.record_ttl),
        )
        .await?;
        Ok(())
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Option<JobRecord>, JobSchedulingError> {
        Ok(get_json(self.store.as_ref(), &Self::record_key(job_id)).await?)
    }

    /// Save the record and queue it for immediate execution.
    pub async fn enqueue(&self, record: &JobRecord) -> Result<(), JobSchedulingError> {
        self.save(record).await?;
        self.store
            .zadd(PENDING_SET, &record.job_id.to_string(), now_millis() as f64)
            .await?;
        debug!("Enqueued job {} for tile {}", record.job_id, record.tile_id);
        self.notify.notify_one();
        Ok(())
    }

    /// Put a claimed job back, due at `not_before`.
    pub async fn requeue_at(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
    ) -> Result<(), JobSchedulingError> {
        let member = job_id.to_string();
        self.store
            .zadd(PENDING_SET, &member, not_before.timestamp_millis() as f64)
            .await?;
        self.store.zrem(RUNNING_SET, &member).await?;
        debug!("Job {} requeued for {}", job_id, not_before);
        Ok(())
    }

    /// Take ownership of the oldest due job, if any.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>, JobSchedulingError> {
        let now = now_millis() as f64;
        let candidates = self
            .store
            .zrange_by_score(PENDING_SET, Some(CLAIM_BATCH))
            .await?;

        for (member, due) in candidates {
            if due > now {
                break;
            }
            if !self.store.zrem(PENDING_SET, &member).await? {
                // Another worker won this one
                continue;
            }
            self.store.zadd(RUNNING_SET, &member, now).await?;

            let record = match Uuid::parse_str(&member) {
                Ok(job_id) => self.load(job_id).await?,
                Err(_) => None,
            };
            match record {
                Some(record) => return Ok(Some(record)),
                None => {
                    warn!("Dropping queued job {} whose record has expired", member);
                    self.store.zrem(RUNNING_SET, &member).await?;
                }
            }
        }
        Ok(None)
    }

    /// Refresh the lease of a running job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<bool, JobSchedulingError> {
        Ok(self
            .store
            .zadd_existing(RUNNING_SET, &job_id.to_string(), now_millis() as f64)
            .await?)
    }

    /// Forget a finished job.
    pub async fn complete(&self, job_id: Uuid) -> Result<(), JobSchedulingError> {
        self.store.zrem(RUNNING_SET, &job_id.to_string()).await?;
        Ok(())
    }

    /// Re-queue running jobs whose last heartbeat is older than `stale_after`.
    ///
    /// Returns how many jobs were put back.
    pub async fn recover(&self, stale_after: Duration) -> Result<usize, JobSchedulingError> {
        let cutoff = now_millis() as f64 - stale_after.as_millis() as f64;
        let mut recovered = 0;
        for (member, heartbeat) in self.store.zrange_by_score(RUNNING_SET, None).await? {
            if heartbeat > cutoff {
                break;
            }
            if self.store.zrem(RUNNING_SET, &member).await? {
                self.store
                    .zadd(PENDING_SET, &member, now_millis() as f64)
                    .await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} abandoned job(s)", recovered);
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    /// Time until the earliest pending job is due; zero if one is due now.
    pub async fn next_due_in(&self) -> Result<Option<Duration>, JobSchedulingError> {
        let first = self.store.zrange_by_score(PENDING_SET, Some(1)).await?;
        Ok(first.first().map(|(_, due)| {
            let wait_ms = (*due - now_millis() as f64).max(0.0);
            Duration::from_millis(wait_ms as u64)
        }))
    }

    pub async fn stats(&self) -> Result<QueueStats, JobSchedulingError> {
        Ok(QueueStats {
            pending: self.store.zcard(PENDING_SET).await?,
            running: self.store.zcard(RUNNING_SET).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::TileJobRequest;
    use crate::state_store::MemoryStateStore;
    use crate::tiles::TileId;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryStateStore::new()), Duration::from_secs(3600))
    }

    fn record() -> JobRecord {
        JobRecord::new(
            TileId::new(42, 17),
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
    async fn test_claim_is_fifo_and_exclusive() {
        let queue = queue();
        let first = record();
        queue.enqueue(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
        let second = record();
        queue.enqueue(&second).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, first.job_id);
        assert_eq!(queue.stats().await.unwrap(), QueueStats { pending: 1, running: 1 });

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, second.job_id);
        assert!(queue.claim_next().await.unwrap().is_none());

        queue.complete(first.job_id).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn test_requeued_job_waits_until_due() {
        let queue = queue();
        let job = record();
        queue.enqueue(&job).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        queue
            .requeue_at(job.job_id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(queue.claim_next().await.unwrap().is_none());
        let wait = queue.next_due_in().await.unwrap().unwrap();
        assert!(wait > Duration::from_secs(50));

        queue.requeue_at(job.job_id, Utc::now()).await.unwrap();
        assert!(queue.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_requeues_stale_running_jobs() {
        let queue = queue();
        let job = record();
        queue.enqueue(&job).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert_eq!(queue.recover(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap(), QueueStats { pending: 1, running: 0 });
        assert_eq!(
            queue.claim_next().await.unwrap().unwrap().job_id,
            job.job_id
        );
    }

    #[tokio::test]
    async fn test_expired_records_are_dropped_on_claim() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let queue = JobQueue::new(store.clone(), Duration::from_secs(3600));
        store
            .zadd(PENDING_SET, &Uuid::new_v4().to_string(), 0.0)
            .await
            .unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }
}
