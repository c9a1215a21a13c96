//! Short-lived claims that keep work from being duplicated.
//!
//! Two kinds of claim share the store:
//! - `dedup:{session_id}:{tile_id}` → job id, taken at submission so one
//!   session never has two in-flight jobs for the same tile;
//! - `tile:lock:{tile_id}` → job id, held while a job fetches or converts a
//!   tile so that no other job (in this process or another) touches the same
//!   files. The eviction sweeper takes the same lock around a removal.
//!
//! Both expire on their own, bounding staleness after a crash, and are
//! released with compare-and-delete so a late release never drops somebody
//! else's claim.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::state_store::StateStore;
use crate::tiles::TileId;

const DEDUP_PREFIX: &str = "dedup:";
const TILE_LOCK_PREFIX: &str = "tile:lock:";

/// Result of trying to take a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Won,
    /// Someone else holds it
    Held(Uuid),
}

#[derive(Debug, Clone)]
pub struct DedupRegistry {
    store: Arc<dyn StateStore>,
    dedup_ttl: Duration,
    lock_ttl: Duration,
}

impl DedupRegistry {
    pub fn new(store: Arc<dyn StateStore>, dedup_ttl: Duration, lock_ttl: Duration) -> Self {
        Self {
            store,
            dedup_ttl,
            lock_ttl,
        }
    }

    fn dedup_key(session_id: &str, tile_id: &TileId) -> String {
        format!("{DEDUP_PREFIX}{session_id}:{tile_id}")
    }

    fn lock_key(tile_id: &TileId) -> String {
        format!("{TILE_LOCK_PREFIX}{tile_id}")
    }

    async fn read_holder(&self, key: &str) -> StoreResult<Option<Uuid>> {
        match self.store.get(key).await? {
            Some(value) => Uuid::parse_str(&value).map(Some).map_err(|_| {
                StoreError::backend(format!("claim {key} holds unreadable value {value:?}"))
            }),
            None => Ok(None),
        }
    }

    async fn claim_key(&self, key: &str, job_id: Uuid, ttl: Duration) -> StoreResult<Claim> {
        let value = job_id.to_string();
        // A second round covers a claim that expired or was released between
        // the insert and the read
        for _ in 0..2 {
            if self.store.set_if_absent(key, &value, Some(ttl)).await? {
                return Ok(Claim::Won);
            }
            if let Some(holder) = self.read_holder(key).await? {
                return Ok(Claim::Held(holder));
            }
        }
        Err(StoreError::backend(format!("claim {key} changed hands while being taken")))
    }

    /// Register `job_id` as the in-flight job for this session and tile.
    pub async fn claim(&self, session_id: &str, tile_id: &TileId, job_id: Uuid) -> StoreResult<Claim> {
        self.claim_key(&Self::dedup_key(session_id, tile_id), job_id, self.dedup_ttl)
            .await
    }

    pub async fn current(&self, session_id: &str, tile_id: &TileId) -> StoreResult<Option<Uuid>> {
        self.read_holder(&Self::dedup_key(session_id, tile_id)).await
    }

    /// Release the session claim if `job_id` still owns it.
    pub async fn release(&self, session_id: &str, tile_id: &TileId, job_id: Uuid) -> StoreResult<bool> {
        let released = self
            .store
            .delete_if_equals(&Self::dedup_key(session_id, tile_id), &job_id.to_string())
            .await?;
        if released {
            debug!("Released dedup claim of job {} on {}", job_id, tile_id);
        }
        Ok(released)
    }

    /// Take the exclusive right to write or remove a tile's artifacts.
    pub async fn lock_tile(&self, tile_id: &TileId, owner: Uuid) -> StoreResult<Claim> {
        self.claim_key(&Self::lock_key(tile_id), owner, self.lock_ttl)
            .await
    }

    pub async fn unlock_tile(&self, tile_id: &TileId, owner: Uuid) -> StoreResult<bool> {
        self.store
            .delete_if_equals(&Self::lock_key(tile_id), &owner.to_string())
            .await
    }

    pub async fn tile_holder(&self, tile_id: &TileId) -> StoreResult<Option<Uuid>> {
        self.read_holder(&Self::lock_key(tile_id)).await
    }
}
