//! Job progress notification.
//!
//! [`ProgressChannel`] fans events out to live subscribers per session and
//! keeps the last event of every job in the shared store (with the status
//! TTL) for clients that poll instead of subscribing. A subscriber that joins
//! late misses earlier events; the stored record always holds the latest.
//!
//! Live delivery is process-local. Polling reads the shared record and
//! therefore works across instances.

pub mod reporter;
pub mod sink;

pub use reporter::ProgressReporter;
pub use sink::{NoopProgress, ProgressSink, ScaledProgress};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::StoreResult;
use crate::job_scheduling::{JobRecord, JobStatus};
use crate::state_store::{StateStore, get_json, set_json};

const PROGRESS_PREFIX: &str = "progress:";
const DEFAULT_CAPACITY: usize = 256;

/// One status/progress update of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    #[schema(example = "0042_0017")]
    pub tile_id: String,
    pub status: JobStatus,
    /// 0 to 100
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            tile_id: record.tile_id.to_string(),
            status: record.status,
            progress: record.progress,
            message: record.message.clone(),
            result_url: record.result_url.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct ProgressChannel {
    store: Arc<dyn StateStore>,
    sessions: RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    status_ttl: Duration,
    capacity: usize,
}

impl ProgressChannel {
    pub fn new(store: Arc<dyn StateStore>, status_ttl: Duration) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            status_ttl,
            capacity: DEFAULT_CAPACITY,
        }
    }

    fn record_key(job_id: Uuid) -> String {
        format!("{PROGRESS_PREFIX}{job_id}")
    }

    /// Persist the event as the job's last known state and deliver it to
    /// the session's live subscribers.
    pub async fn publish(&self, session_id: &str, event: ProgressEvent) -> StoreResult<()> {
        set_json(
            self.store.as_ref(),
            &Self::record_key(event.job_id),
            &event,
            Some(self.status_ttl),
        )
        .await?;

        let sessions = self.sessions.read().await;
        if let Some(sender) = sessions.get(session_id) {
            // No receivers is fine; the stored record covers polling clients
            match sender.send(event) {
                Ok(receivers) => trace!("Progress delivered to {} subscriber(s)", receivers),
                Err(_) => trace!("No live subscribers for session {}", session_id),
            }
        }
        Ok(())
    }

    /// Live events of one session from now on.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<ProgressEvent> {
        if let Some(sender) = self.sessions.read().await.get(session_id) {
            return sender.subscribe();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// The last event published for a job, if it has not expired.
    pub async fn last_event(&self, job_id: Uuid) -> StoreResult<Option<ProgressEvent>> {
        get_json(self.store.as_ref(), &Self::record_key(job_id)).await
    }

    /// Drop session channels nobody listens to. Returns how many went.
    pub async fn prune_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, sender| sender.receiver_count() > 0);
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!("Pruned {} idle progress session(s)", pruned);
        }
        pruned
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
