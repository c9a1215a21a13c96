//! Service wiring shared by the binary and the integration tests.

use anyhow::Result;
use axum::Router;
use sandboxed_artifacts::{ArtifactSandbox, QuotaPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheStore, EvictionSweeper};
use crate::config::Config;
use crate::job_scheduling::{DedupRegistry, JobQueue, JobQueueRunner, RetryPolicy, RunnerSettings};
use crate::pipeline::{HttpFetcher, SubprocessConverter};
use crate::progress::ProgressChannel;
use crate::services::{JobOrchestrator, OrchestratorSettings, TilePipeline};
use crate::state_store::{self, StateStore};
use crate::tiles::TileGrid;
use crate::web::{AppState, create_router};

/// Added to the job timeout to get the tile lock lifetime.
const TILE_LOCK_MARGIN: Duration = Duration::from_secs(60);
/// How often idle progress channels are dropped.
const PROGRESS_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Application {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub cache: CacheStore,
    pub orchestrator: Arc<JobOrchestrator>,
    pub runner: Arc<JobQueueRunner>,
    pub sweeper: Arc<EvictionSweeper>,
}

impl Application {
    /// Build with the configured store, the HTTP fetcher and the external converter.
    pub async fn build(config: Config) -> Result<Self> {
        let store = state_store::connect(&config.database).await?;
        let pipeline = TilePipeline {
            fetcher: Arc::new(HttpFetcher::new(
                &config.upstream,
                config.storage.min_free_disk_bytes,
            )?),
            converter: Arc::new(SubprocessConverter::new(&config.converter)?),
        };
        Self::build_with(config, store, pipeline).await
    }

    /// Build around an existing store and pipeline.
    ///
    /// Reconciles the cache with the disk before returning, so no job may
    /// run before this completes.
    pub async fn build_with(
        config: Config,
        store: Arc<dyn StateStore>,
        pipeline: TilePipeline,
    ) -> Result<Self> {
        let policy = QuotaPolicy::new(config.storage.max_cache_bytes)
            .target_ratio(config.eviction.target_ratio)
            .min_idle(config.eviction.safety_margin)
            .enabled(config.eviction.enabled);
        let sandbox = ArtifactSandbox::builder()
            .base_directory(&config.storage.cache_dir)
            .quota_policy(policy)
            .build()
            .await?;
        info!(
            "Tile cache at {} (quota {} bytes, target {} bytes)",
            sandbox.base_dir().display(),
            policy.max_bytes,
            policy.target_bytes()
        );

        let cache = CacheStore::new(
            store.clone(),
            sandbox,
            config.converter.descriptor_file.clone(),
            config.upstream.raw_extension.clone(),
        );
        cache.reconcile().await?;

        let registry = DedupRegistry::new(
            store.clone(),
            config.jobs.dedup_ttl,
            config.jobs.job_timeout + TILE_LOCK_MARGIN,
        );
        let queue = JobQueue::new(store.clone(), config.jobs.status_ttl);
        let progress = Arc::new(ProgressChannel::new(store.clone(), config.jobs.status_ttl));

        let orchestrator = Arc::new(JobOrchestrator::new(
            TileGrid::from_config(&config.grid),
            cache.clone(),
            queue.clone(),
            registry.clone(),
            progress,
            pipeline,
            OrchestratorSettings {
                retry: RetryPolicy::from_config(&config.jobs),
                job_timeout: config.jobs.job_timeout,
            },
        ));
        let runner = Arc::new(JobQueueRunner::new(
            queue,
            orchestrator.clone(),
            RunnerSettings::from_config(&config.jobs),
        ));
        let sweeper = Arc::new(EvictionSweeper::new(
            cache.clone(),
            registry,
            store.clone(),
            config.eviction.interval,
        ));

        Ok(Self {
            config,
            store,
            cache,
            orchestrator,
            runner,
            sweeper,
        })
    }

    pub fn router(&self) -> Router {
        create_router(self.app_state())
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.orchestrator.clone(), self.config.clone())
    }

    /// Start the job runner, the eviction sweeper and progress housekeeping.
    pub fn spawn_background(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let runner = self.runner.clone();
        let runner_token = token.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = runner.run(runner_token).await {
                tracing::error!("Job queue runner failed: {}", e);
            }
        }));

        let sweeper = self.sweeper.clone();
        let sweeper_token = token.clone();
        handles.push(tokio::spawn(async move {
            sweeper.run(sweeper_token).await;
        }));

        let progress = self.orchestrator.progress().clone();
        let prune_token = token.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = prune_token.cancelled() => break,
                    _ = tokio::time::sleep(PROGRESS_PRUNE_INTERVAL) => {
                        let pruned = progress.prune_idle().await;
                        if pruned > 0 {
                            debug!("Dropped {} idle progress channel(s)", pruned);
                        }
                    }
                }
            }
        }));

        handles
    }
}
