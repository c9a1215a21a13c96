//! Two-tier tile cache: raw downloads and converted octrees.
//!
//! Files live in an [`ArtifactSandbox`] (`raw/{tile_id}/` and
//! `converted/{tile_id}/`); metadata and the recency index live in the shared
//! [`StateStore`]. The converted descriptor file is the only cache-hit
//! signal: a converted directory without it is a partial write and counts as
//! a miss.
//!
//! Removal order is recency index, then files (each tier disappears in one
//! rename), then metadata. A reader that finds the descriptor therefore
//! always finds complete files, and [`CacheStore::touch`] can never bring an
//! entry back into the recency index once its removal has begun.

pub mod eviction;

pub use eviction::{EvictionResult, EvictionSweeper};

use chrono::{DateTime, Utc};
use sandboxed_artifacts::ArtifactSandbox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::errors::CacheResult;
use crate::state_store::{StateStore, get_json, now_millis, set_json};
use crate::tiles::TileId;

const ENTRY_PREFIX: &str = "cache:entry:";
const RECENCY_SET: &str = "cache:recency";
const RAW_TIER: &str = "raw";
const CONVERTED_TIER: &str = "converted";

/// One stored artifact, addressed relative to the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ArtifactInfo {
    pub path: String,
    pub size_bytes: u64,
}

/// What a tile has on disk. A converted artifact always comes with the raw
/// one it was produced from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheArtifacts {
    RawOnly(ArtifactInfo),
    Converted {
        raw: ArtifactInfo,
        converted: ArtifactInfo,
    },
}

impl CacheArtifacts {
    fn into_parts(self) -> (ArtifactInfo, Option<ArtifactInfo>) {
        match self {
            CacheArtifacts::RawOnly(raw) => (raw, None),
            CacheArtifacts::Converted { raw, converted } => (raw, Some(converted)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    tile_id: TileId,
    raw: ArtifactInfo,
    converted: Option<ArtifactInfo>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Cache metadata for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CacheEntry {
    #[schema(value_type = String)]
    pub tile_id: TileId,
    pub raw: ArtifactInfo,
    pub converted: Option<ArtifactInfo>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    /// Bytes across both tiers; a missing tier counts as zero.
    pub fn total_bytes(&self) -> u64 {
        self.raw.size_bytes + self.converted.as_ref().map_or(0, |c| c.size_bytes)
    }

    pub fn is_converted(&self) -> bool {
        self.converted.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct CacheStats {
    pub entries: u64,
    pub converted_entries: u64,
    pub raw_bytes: u64,
    pub converted_bytes: u64,
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub target_bytes: u64,
}

/// Outcome of [`CacheStore::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restored: usize,
    pub dropped_metadata: usize,
    pub discarded_partials: usize,
}

/// Cache tier availability for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStatus {
    pub raw_cached: bool,
    pub converted_cached: bool,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    store: Arc<dyn StateStore>,
    sandbox: ArtifactSandbox,
    descriptor_file: String,
    raw_extension: String,
}

impl CacheStore {
    pub fn new(
        store: Arc<dyn StateStore>,
        sandbox: ArtifactSandbox,
        descriptor_file: impl Into<String>,
        raw_extension: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sandbox,
            descriptor_file: descriptor_file.into(),
            raw_extension: raw_extension.into(),
        }
    }

    pub fn sandbox(&self) -> &ArtifactSandbox {
        &self.sandbox
    }

    pub fn descriptor_file(&self) -> &str {
        &self.descriptor_file
    }

    pub fn raw_dir(&self, tile_id: &TileId) -> String {
        format!("{RAW_TIER}/{tile_id}")
    }

    pub fn raw_artifact(&self, tile_id: &TileId) -> String {
        format!("{RAW_TIER}/{tile_id}/{tile_id}.{}", self.raw_extension)
    }

    pub fn converted_dir(&self, tile_id: &TileId) -> String {
        format!("{CONVERTED_TIER}/{tile_id}")
    }

    pub fn descriptor(&self, tile_id: &TileId) -> String {
        format!("{CONVERTED_TIER}/{tile_id}/{}", self.descriptor_file)
    }

    /// Absolute directory the converter writes into.
    pub fn converted_dir_path(&self, tile_id: &TileId) -> CacheResult<PathBuf> {
        Ok(self.sandbox.resolve(&self.converted_dir(tile_id))?)
    }

    fn entry_key(tile_id: &TileId) -> String {
        format!("{ENTRY_PREFIX}{tile_id}")
    }

    pub async fn get(&self, tile_id: &TileId) -> CacheResult<Option<CacheEntry>> {
        let Some(stored) =
            get_json::<StoredEntry>(self.store.as_ref(), &Self::entry_key(tile_id)).await?
        else {
            return Ok(None);
        };
        let last_accessed = self
            .store
            .zscore(RECENCY_SET, &tile_id.to_string())
            .await?
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
            .unwrap_or(stored.updated_at);
        Ok(Some(CacheEntry {
            tile_id: stored.tile_id,
            raw: stored.raw,
            converted: stored.converted,
            created_at: stored.created_at,
            last_accessed,
        }))
    }

    /// Record the artifacts of a tile and mark it as just used.
    pub async fn put(&self, tile_id: &TileId, artifacts: CacheArtifacts) -> CacheResult<CacheEntry> {
        self.write_entry(tile_id, artifacts, true).await
    }

    async fn write_entry(
        &self,
        tile_id: &TileId,
        artifacts: CacheArtifacts,
        bump_recency: bool,
    ) -> CacheResult<CacheEntry> {
        let key = Self::entry_key(tile_id);
        let now = Utc::now();
        let created_at = get_json::<StoredEntry>(self.store.as_ref(), &key)
            .await?
            .map_or(now, |existing| existing.created_at);
        let (raw, converted) = artifacts.into_parts();
        let stored = StoredEntry {
            tile_id: *tile_id,
            raw,
            converted,
            created_at,
            updated_at: now,
        };
        set_json(self.store.as_ref(), &key, &stored, None).await?;

        let member = tile_id.to_string();
        let has_score = self.store.zscore(RECENCY_SET, &member).await?.is_some();
        if bump_recency || !has_score {
            self.store
                .zadd(RECENCY_SET, &member, now.timestamp_millis() as f64)
                .await?;
        }

        debug!(
            "Cached tile {} (raw {} bytes, converted {:?} bytes)",
            tile_id,
            stored.raw.size_bytes,
            stored.converted.as_ref().map(|c| c.size_bytes)
        );
        self.get(tile_id).await.map(|entry| {
            entry.unwrap_or(CacheEntry {
                tile_id: stored.tile_id,
                raw: stored.raw,
                converted: stored.converted,
                created_at,
                last_accessed: now,
            })
        })
    }

    /// Bump recency. Returns `false` for tiles not (or no longer) in the index.
    pub async fn touch(&self, tile_id: &TileId) -> CacheResult<bool> {
        Ok(self
            .store
            .zadd_existing(RECENCY_SET, &tile_id.to_string(), now_millis() as f64)
            .await?)
    }

    /// Cached tiles, least recently used first.
    pub async fn list_ordered_by_recency(&self) -> CacheResult<Vec<TileId>> {
        Ok(self
            .recency()
            .await?
            .into_iter()
            .map(|(tile_id, _)| tile_id)
            .collect())
    }

    /// Cached tiles with their last access time, least recently used first.
    pub async fn recency(&self) -> CacheResult<Vec<(TileId, DateTime<Utc>)>> {
        let members = self.store.zrange_by_score(RECENCY_SET, None).await?;
        let mut ordered = Vec::with_capacity(members.len());
        for (member, score) in members {
            match member.parse::<TileId>() {
                Ok(tile_id) => {
                    let at = DateTime::from_timestamp_millis(score as i64).unwrap_or_default();
                    ordered.push((tile_id, at));
                }
                Err(e) => warn!("Ignoring malformed recency member '{}': {}", member, e),
            }
        }
        Ok(ordered)
    }

    /// Remove the metadata of a tile, then both tiers.
    ///
    /// Metadata goes first so that no reader is handed an entry whose files
    /// are already gone. Returns whether anything was removed.
    pub async fn remove(&self, tile_id: &TileId) -> CacheResult<bool> {
        let member = tile_id.to_string();
        let metadata = self.store.delete(&Self::entry_key(tile_id)).await?;
        let indexed = self.store.zrem(RECENCY_SET, &member).await?;
        let converted = self
            .sandbox
            .remove_dir_atomic(&self.converted_dir(tile_id))
            .await?;
        let raw = self.sandbox.remove_dir_atomic(&self.raw_dir(tile_id)).await?;
        if indexed || converted || raw || metadata {
            info!("Removed cached tile {}", tile_id);
        }
        Ok(indexed || converted || raw || metadata)
    }

    /// Whether the converted descriptor is on disk.
    pub async fn is_converted_ready(&self, tile_id: &TileId) -> CacheResult<bool> {
        Ok(self.sandbox.exists(&self.descriptor(tile_id)).await?)
    }

    /// Whether a complete, non-empty raw artifact is on disk.
    pub async fn has_raw(&self, tile_id: &TileId) -> CacheResult<bool> {
        Ok(self
            .sandbox
            .file_size(&self.raw_artifact(tile_id))
            .await?
            .is_some_and(|size| size > 0))
    }

    pub async fn tier_status(&self, tile_id: &TileId) -> CacheResult<TierStatus> {
        Ok(TierStatus {
            raw_cached: self.has_raw(tile_id).await?,
            converted_cached: self.is_converted_ready(tile_id).await?,
        })
    }

    /// The entry of a tile whose converted output is complete, if any.
    ///
    /// Metadata lost by a crash after the descriptor was written is rebuilt
    /// from disk.
    pub async fn lookup_ready(&self, tile_id: &TileId) -> CacheResult<Option<CacheEntry>> {
        if !self.is_converted_ready(tile_id).await? {
            return Ok(None);
        }
        match self.get(tile_id).await? {
            Some(entry) if entry.is_converted() => Ok(Some(entry)),
            _ => {
                debug!("Rebuilding cache metadata for {} from disk", tile_id);
                self.record_from_disk(tile_id).await
            }
        }
    }

    /// Measure what is on disk for a tile and store it as the entry.
    ///
    /// A converted directory only counts once its descriptor exists. With
    /// nothing usable on disk the metadata is dropped and `None` returned.
    pub async fn record_from_disk(&self, tile_id: &TileId) -> CacheResult<Option<CacheEntry>> {
        match self.measure(tile_id).await? {
            Some(artifacts) => Ok(Some(self.put(tile_id, artifacts).await?)),
            None => {
                self.store.delete(&Self::entry_key(tile_id)).await?;
                self.store.zrem(RECENCY_SET, &tile_id.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn measure(&self, tile_id: &TileId) -> CacheResult<Option<CacheArtifacts>> {
        let raw_path = self.raw_artifact(tile_id);
        let raw_size = self.sandbox.file_size(&raw_path).await?.unwrap_or(0);
        let converted = if self.is_converted_ready(tile_id).await? {
            let dir = self.converted_dir(tile_id);
            let size = self.sandbox.dir_size(&dir).await?;
            Some(ArtifactInfo {
                path: dir,
                size_bytes: size,
            })
        } else {
            None
        };
        let raw = ArtifactInfo {
            path: raw_path,
            size_bytes: raw_size,
        };

        Ok(match converted {
            Some(converted) => Some(CacheArtifacts::Converted { raw, converted }),
            None if raw_size > 0 => Some(CacheArtifacts::RawOnly(raw)),
            None => None,
        })
    }

    /// Delete leftovers of an interrupted run: the `.part` download and a
    /// converted directory without its descriptor.
    ///
    /// Returns how many leftovers were removed.
    pub async fn discard_partial(&self, tile_id: &TileId) -> CacheResult<usize> {
        let mut removed = 0;
        if self
            .sandbox
            .remove_file(&format!("{}.part", self.raw_artifact(tile_id)))
            .await?
        {
            removed += 1;
        }
        let converted_dir = self.converted_dir(tile_id);
        if self.sandbox.exists(&converted_dir).await? && !self.is_converted_ready(tile_id).await? {
            self.sandbox.remove_dir_atomic(&converted_dir).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Discarded {} partial artifact(s) of {}", removed, tile_id);
        }
        Ok(removed)
    }

    /// Drop the raw tier so the next run downloads it again.
    pub async fn discard_raw(&self, tile_id: &TileId) -> CacheResult<()> {
        self.sandbox.remove_dir_atomic(&self.raw_dir(tile_id)).await?;
        if !self.is_converted_ready(tile_id).await? {
            self.store.delete(&Self::entry_key(tile_id)).await?;
            self.store.zrem(RECENCY_SET, &tile_id.to_string()).await?;
        }
        Ok(())
    }

    pub async fn entries(&self) -> CacheResult<Vec<CacheEntry>> {
        let keys = self.store.keys_with_prefix(ENTRY_PREFIX).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Ok(tile_id) = key[ENTRY_PREFIX.len()..].parse::<TileId>() else {
                warn!("Ignoring malformed cache key '{}'", key);
                continue;
            };
            if let Some(entry) = self.get(&tile_id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let quota = self.sandbox.quota();
        let mut stats = CacheStats {
            quota_bytes: quota.max_bytes,
            target_bytes: quota.target_bytes(),
            ..CacheStats::default()
        };
        for entry in self.entries().await? {
            stats.entries += 1;
            stats.raw_bytes += entry.raw.size_bytes;
            if let Some(converted) = &entry.converted {
                stats.converted_entries += 1;
                stats.converted_bytes += converted.size_bytes;
            }
        }
        stats.total_bytes = stats.raw_bytes + stats.converted_bytes;
        Ok(stats)
    }

    /// Bring metadata in line with the files on disk.
    ///
    /// Run at startup, before any worker writes: partial outputs are
    /// discarded, tiles on disk without metadata are re-registered and
    /// metadata without files is dropped.
    pub async fn reconcile(&self) -> CacheResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut on_disk = BTreeSet::new();
        for tier in [RAW_TIER, CONVERTED_TIER] {
            for name in self.sandbox.list_dirs(tier).await? {
                match name.parse::<TileId>() {
                    Ok(tile_id) => {
                        on_disk.insert(tile_id);
                    }
                    Err(_) => warn!("Ignoring unexpected directory {}/{}", tier, name),
                }
            }
        }

        for tile_id in &on_disk {
            report.discarded_partials += self.discard_partial(tile_id).await?;
            let known = self.get(tile_id).await?.is_some();
            match self.measure(tile_id).await? {
                Some(artifacts) => {
                    self.write_entry(tile_id, artifacts, false).await?;
                    if !known {
                        report.restored += 1;
                    }
                }
                None => {
                    self.sandbox.remove_dir_atomic(&self.raw_dir(tile_id)).await?;
                    if known {
                        self.store.delete(&Self::entry_key(tile_id)).await?;
                        report.dropped_metadata += 1;
                    }
                    self.store.zrem(RECENCY_SET, &tile_id.to_string()).await?;
                }
            }
        }

        for key in self.store.keys_with_prefix(ENTRY_PREFIX).await? {
            let orphan = match key[ENTRY_PREFIX.len()..].parse::<TileId>() {
                Ok(tile_id) => !on_disk.contains(&tile_id),
                Err(_) => true,
            };
            if orphan {
                self.store.delete(&key).await?;
                self.store
                    .zrem(RECENCY_SET, &key[ENTRY_PREFIX.len()..])
                    .await?;
                report.dropped_metadata += 1;
            }
        }

        for (member, _) in self.store.zrange_by_score(RECENCY_SET, None).await? {
            let indexed = match member.parse::<TileId>() {
                Ok(tile_id) => on_disk.contains(&tile_id),
                Err(_) => false,
            };
            if !indexed {
                self.store.zrem(RECENCY_SET, &member).await?;
            }
        }

        info!(
            "Cache reconciled: {} restored, {} stale metadata dropped, {} partial artifacts discarded",
            report.restored, report.dropped_metadata, report.discarded_partials
        );
        Ok(report)
    }
}
