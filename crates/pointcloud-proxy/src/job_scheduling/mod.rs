//! Job scheduling for tile preparation
//!
//! Jobs are persisted in the shared state store and claimed by a pool of
//! workers, so any instance can run a job submitted to any other. This
//! module provides:
//!
//! - **DedupRegistry**: one live job per session and tile, one worker per tile
//! - **JobQueue**: durable pending/running sets with delayed re-queueing
//! - **JobQueueRunner**: worker pool with leases and graceful shutdown
//! - **RetryPolicy**: capped exponential backoff for transient failures

pub mod dedup;
pub mod job_queue;
pub mod job_queue_runner;
pub mod retry;
pub mod types;

pub use dedup::{Claim, DedupRegistry};
pub use job_queue::{JobQueue, QueueStats};
pub use job_queue_runner::{JobHandler, JobOutcome, JobQueueRunner, RunnerSettings};
pub use retry::RetryPolicy;
pub use types::{JobRecord, JobSchedulingError, JobStatus, TileJobRequest};
