//! Shared harness for the integration tests: an application wired to an
//! in-memory state store, a temporary cache directory and scripted pipeline
//! steps that never touch the network or spawn processes.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use sandboxed_artifacts::ArtifactSandbox;

use pointcloud_proxy::{
    app::Application,
    config::Config,
    errors::{PipelineError, PipelineResult},
    job_scheduling::{JobHandler, JobOutcome, JobRecord, TileJobRequest},
    pipeline::{Converter, Fetcher},
    progress::ProgressSink,
    services::TilePipeline,
    state_store::MemoryStateStore,
    tiles::{ProjectedBounds, Tile},
};

/// Bern, inside the default region.
pub const BERN: (f64, f64) = (46.948, 7.4474);
/// Zurich, a different tile.
pub const ZURICH: (f64, f64) = (47.3769, 8.5417);

pub const RAW_PAYLOAD: &[u8] = b"LASF raw point payload";

/// Writes the raw artifact after failing a configurable number of times.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    pub calls: AtomicUsize,
    /// Calls that fail with a transport error before the first success;
    /// `usize::MAX` fails forever
    pub failures: usize,
    /// Time spent "downloading" before the payload lands
    pub delay: Duration,
}

impl ScriptedFetcher {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Leaves a `.part` file behind while it sleeps for `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        tile: &Tile,
        sandbox: &ArtifactSandbox,
        raw_artifact: &str,
        on_progress: &dyn ProgressSink,
    ) -> PipelineResult<PathBuf> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        on_progress.report(10.0, "Downloading").await;
        if call < self.failures {
            return Err(PipelineError::Transport {
                url: format!("http://upstream.test/{}", tile.tile_id),
                message: "connection reset".to_string(),
            });
        }

        if !self.delay.is_zero() {
            let partial = sandbox.partial_path(raw_artifact).await?;
            tokio::fs::write(&partial, &RAW_PAYLOAD[..4])
                .await
                .map_err(|e| PipelineError::io("writing partial artifact", e, &partial))?;
            tokio::time::sleep(self.delay).await;
        }
        let path = sandbox.write_atomic(raw_artifact, RAW_PAYLOAD).await?;
        sandbox.remove_file(&format!("{raw_artifact}.part")).await?;
        on_progress.report(50.0, "Downloading").await;
        on_progress.report(100.0, "Download complete").await;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterBehaviour {
    Succeed,
    /// Exits cleanly but never writes the descriptor
    SkipDescriptor,
    /// Fails like a non-zero exit
    Crash,
}

/// Writes `metadata.json` plus one octree file into the output directory.
#[derive(Debug)]
pub struct ScriptedConverter {
    pub calls: AtomicUsize,
    pub behaviour: ConverterBehaviour,
}

impl ScriptedConverter {
    pub fn new(behaviour: ConverterBehaviour) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            behaviour,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for ScriptedConverter {
    async fn convert(
        &self,
        tile: &Tile,
        raw_artifact: &Path,
        output_dir: &Path,
        on_progress: &dyn ProgressSink,
        _crop_bbox: Option<&ProjectedBounds>,
    ) -> PipelineResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !raw_artifact.exists() {
            return Err(PipelineError::invalid_input("raw artifact missing"));
        }
        let data_dir = output_dir.join("data");
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| PipelineError::io("creating output directory", e, output_dir))?;
        on_progress.report(40.0, "Converting point cloud").await;
        tokio::fs::write(data_dir.join("octree.bin"), b"octree nodes")
            .await
            .map_err(|e| PipelineError::io("writing octree", e, output_dir))?;

        match self.behaviour {
            ConverterBehaviour::Succeed => {
                let descriptor = output_dir.join("metadata.json");
                tokio::fs::write(&descriptor, format!("{{\"name\":\"{}\"}}", tile.tile_id))
                    .await
                    .map_err(|e| PipelineError::io("writing descriptor", e, &descriptor))?;
                on_progress.report(100.0, "Conversion complete").await;
                Ok(output_dir.to_path_buf())
            }
            ConverterBehaviour::SkipDescriptor => Ok(output_dir.to_path_buf()),
            ConverterBehaviour::Crash => Err(PipelineError::ConverterFailed {
                exit_code: Some(1),
                output: "segmentation fault".to_string(),
            }),
        }
    }
}

pub struct Harness {
    pub app: Application,
    pub fetcher: Arc<ScriptedFetcher>,
    pub converter: Arc<ScriptedConverter>,
    pub cache_dir: TempDir,
}

pub fn test_config(cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.cache_dir = cache_dir.to_path_buf();
    config.storage.max_cache_bytes = 10 * 1024 * 1024;
    config.jobs.max_attempts = 3;
    config.jobs.retry_initial_delay = Duration::from_millis(10);
    config.jobs.retry_max_delay = Duration::from_millis(40);
    config.jobs.poll_interval = Duration::from_millis(20);
    config.jobs.shutdown_grace = Duration::from_secs(1);
    config.jobs.job_timeout = Duration::from_secs(30);
    config.eviction.interval = Duration::from_secs(3600);
    config
}

impl Harness {
    pub async fn new(fetcher: ScriptedFetcher, behaviour: ConverterBehaviour) -> Self {
        let cache_dir = TempDir::new().unwrap();
        Self::with_config(test_config(cache_dir.path()), cache_dir, fetcher, behaviour).await
    }

    pub async fn with_config(
        config: Config,
        cache_dir: TempDir,
        fetcher: ScriptedFetcher,
        behaviour: ConverterBehaviour,
    ) -> Self {
        let fetcher = Arc::new(fetcher);
        let converter = Arc::new(ScriptedConverter::new(behaviour));
        let pipeline = TilePipeline {
            fetcher: fetcher.clone(),
            converter: converter.clone(),
        };
        let app = Application::build_with(config, Arc::new(MemoryStateStore::new()), pipeline)
            .await
            .unwrap();
        Self {
            app,
            fetcher,
            converter,
            cache_dir,
        }
    }

    /// Run queued jobs on the calling task until the queue is empty.
    ///
    /// Retries are re-queued as due immediately, so backoff delays do not
    /// slow the tests down. Returns how many executions happened.
    pub async fn drain(&self) -> usize {
        let queue = self.app.orchestrator.queue();
        let mut executions = 0;
        while let Some(job) = queue.claim_next().await.unwrap() {
            executions += 1;
            assert!(executions < 100, "queue did not drain");
            let job_id = job.job_id;
            match self.app.orchestrator.execute(job).await {
                JobOutcome::Finished => queue.complete(job_id).await.unwrap(),
                JobOutcome::RetryAt(_) => {
                    queue.requeue_at(job_id, chrono::Utc::now()).await.unwrap()
                }
            }
        }
        executions
    }

    pub async fn record(&self, job_id: uuid::Uuid) -> JobRecord {
        self.app
            .orchestrator
            .queue()
            .load(job_id)
            .await
            .unwrap()
            .expect("job record")
    }
}

pub fn request(session: &str, (lat, lon): (f64, f64)) -> TileJobRequest {
    TileJobRequest {
        parcel_id: format!("parcel-{session}"),
        lat,
        lon,
        session_id: session.to_string(),
        crop_bbox: None,
    }
}
