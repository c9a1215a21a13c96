//! Background quota enforcement for the tile cache.
//!
//! Every interval the sweeper sums the bytes of all cache entries (a missing
//! tier counts as zero). Over quota, it removes least recently used entries
//! until usage falls to the policy's target ratio of the quota, leaving a
//! hysteresis band so the next write does not immediately trigger another
//! sweep.
//!
//! The sweeper takes a tile's write lock for the duration of a removal, so an
//! entry is never evicted while a job holds that lock and no job can start on
//! a tile that is being removed. Entries accessed within the policy's idle
//! margin before the sweep started are left alone.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::CacheStore;
use crate::errors::CacheResult;
use crate::job_scheduling::{Claim, DedupRegistry};
use crate::state_store::StateStore;

/// Result of an eviction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionResult {
    /// Number of cache entries removed
    pub entries_evicted: usize,
    /// Total bytes freed
    pub bytes_freed: u64,
    /// Cache size before eviction
    pub size_before: u64,
    /// Cache size after eviction
    pub size_after: u64,
    /// Candidates left alone because a job is writing them
    pub skipped_in_flight: usize,
    /// Expired store keys dropped during the run
    pub expired_keys_purged: u64,
    /// Duration of the run in milliseconds
    pub duration_ms: u64,
}

pub struct EvictionSweeper {
    cache: CacheStore,
    registry: DedupRegistry,
    store: Arc<dyn StateStore>,
    interval: Duration,
}

impl EvictionSweeper {
    pub fn new(
        cache: CacheStore,
        registry: DedupRegistry,
        store: Arc<dyn StateStore>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            registry,
            store,
            interval,
        }
    }

    /// Sweep on a fixed interval until cancelled.
    pub async fn run(&self, cancellation: CancellationToken) {
        let policy = self.cache.sandbox().quota();
        info!(
            max_bytes = policy.max_bytes,
            target_bytes = policy.target_bytes(),
            interval_secs = self.interval.as_secs(),
            enabled = policy.enabled,
            "Starting cache eviction sweeper"
        );

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Cache eviction sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep().await {
                        Ok(result) => log_eviction_result(&result),
                        Err(e) => warn!("Cache eviction sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass: purge expired store keys, then evict down to the target.
    pub async fn sweep(&self) -> CacheResult<EvictionResult> {
        let start = Instant::now();
        let sweep_started = Utc::now();
        let policy = *self.cache.sandbox().quota();

        let mut result = EvictionResult {
            expired_keys_purged: self.store.purge_expired().await?,
            ..EvictionResult::default()
        };

        let entries: HashMap<_, _> = self
            .cache
            .entries()
            .await?
            .into_iter()
            .map(|entry| (entry.tile_id, entry))
            .collect();
        result.size_before = entries.values().map(|entry| entry.total_bytes()).sum();
        result.size_after = result.size_before;

        if !policy.enabled || !policy.is_over_quota(result.size_before) {
            debug!(
                size_bytes = result.size_before,
                limit_bytes = policy.max_bytes,
                "Tile cache under limit, no eviction needed"
            );
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let target = policy.target_bytes();
        // Owner of the tile locks taken while removing entries
        let sweep_id = Uuid::new_v4();
        let idle_cutoff = sweep_started
            - chrono::Duration::from_std(policy.min_idle).unwrap_or_else(|_| chrono::Duration::zero());
        info!(
            current_size_bytes = result.size_before,
            limit_bytes = policy.max_bytes,
            target_bytes = target,
            bytes_to_free = policy.bytes_to_free(result.size_before),
            entry_count = entries.len(),
            "Tile cache over limit, starting eviction"
        );

        for (tile_id, last_accessed) in self.cache.recency().await? {
            if result.size_after <= target {
                break;
            }
            // Oldest first, so everything after this is recent as well
            if last_accessed > idle_cutoff {
                debug!(tile_id = %tile_id, "Stopping eviction at recently used tile");
                break;
            }
            let Some(entry) = entries.get(&tile_id) else {
                continue;
            };
            match self.registry.lock_tile(&tile_id, sweep_id).await {
                Ok(Claim::Won) => {}
                Ok(Claim::Held(holder)) => {
                    debug!(tile_id = %tile_id, holder = %holder, "Skipping tile held by a job");
                    result.skipped_in_flight += 1;
                    continue;
                }
                Err(e) => {
                    warn!(tile_id = %tile_id, "Failed to lock tile for eviction: {}", e);
                    result.skipped_in_flight += 1;
                    continue;
                }
            }

            let removed = self.cache.remove(&tile_id).await;
            if let Err(e) = self.registry.unlock_tile(&tile_id, sweep_id).await {
                warn!(tile_id = %tile_id, "Failed to unlock evicted tile: {}", e);
            }
            match removed {
                Ok(_) => {
                    let size = entry.total_bytes();
                    result.entries_evicted += 1;
                    result.bytes_freed += size;
                    result.size_after = result.size_after.saturating_sub(size);
                }
                Err(e) => warn!(tile_id = %tile_id, "Failed to evict cached tile: {}", e),
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

fn log_eviction_result(result: &EvictionResult) {
    if result.entries_evicted > 0 {
        info!(
            entries_evicted = result.entries_evicted,
            bytes_freed = result.bytes_freed,
            size_before = result.size_before,
            size_after = result.size_after,
            skipped_in_flight = result.skipped_in_flight,
            duration_ms = result.duration_ms,
            "Tile cache eviction complete"
        );
    } else if result.size_after > 0 {
        debug!(
            size_bytes = result.size_after,
            expired_keys_purged = result.expired_keys_purged,
            "Tile cache sweep complete"
        );
    }
}
