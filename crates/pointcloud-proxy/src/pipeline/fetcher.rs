//! Raw tile download.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use sandboxed_artifacts::ArtifactSandbox;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::errors::{AppError, AppResult, PipelineError, PipelineResult};
use crate::progress::ProgressSink;
use crate::tiles::Tile;

/// Downloads the raw artifact of a tile into the cache sandbox.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Store the artifact at `raw_artifact`, a path relative to `sandbox`.
    ///
    /// Returns the absolute path of the complete raw artifact.
    async fn fetch(
        &self,
        tile: &Tile,
        sandbox: &ArtifactSandbox,
        raw_artifact: &str,
        on_progress: &dyn ProgressSink,
    ) -> PipelineResult<PathBuf>;
}

/// A source URL with `{tile_id}`, `{grid_x}`, `{grid_y}`, `{min_e}` and
/// `{min_n}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    /// Check that the template renders to a valid absolute URL.
    pub fn parse(template: &str) -> AppResult<Self> {
        let template = Self(template.trim().to_string());
        let sample = template.render_parts("0000_0000", 0, 0, 0.0, 0.0);
        url::Url::parse(&sample).map_err(|e| {
            AppError::configuration(format!("Invalid upstream URL template '{}': {}", template.0, e))
        })?;
        Ok(template)
    }

    pub fn render(&self, tile: &Tile) -> String {
        self.render_parts(
            &tile.tile_id.to_string(),
            tile.grid_x,
            tile.grid_y,
            tile.bounds.min_e,
            tile.bounds.min_n,
        )
    }

    fn render_parts(&self, tile_id: &str, grid_x: i64, grid_y: i64, min_e: f64, min_n: f64) -> String {
        self.0
            .replace("{tile_id}", tile_id)
            .replace("{grid_x}", &grid_x.to_string())
            .replace("{grid_y}", &grid_y.to_string())
            .replace("{min_e}", &format!("{:.0}", min_e))
            .replace("{min_n}", &format!("{:.0}", min_n))
    }
}

/// Streams tiles over HTTP, falling back to a secondary source.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    sources: Vec<UrlTemplate>,
    read_timeout: Duration,
    min_free_disk_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &UpstreamConfig, min_free_disk_bytes: u64) -> AppResult<Self> {
        let mut sources = vec![UrlTemplate::parse(&config.primary_url_template)?];
        if let Some(secondary) = &config.secondary_url_template {
            sources.push(UrlTemplate::parse(secondary)?);
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            sources,
            read_timeout: config.read_timeout,
            min_free_disk_bytes,
        })
    }

    async fn ensure_disk_space(&self, dir: &Path) -> PipelineResult<()> {
        if self.min_free_disk_bytes == 0 {
            return Ok(());
        }
        let target = dir.to_path_buf();
        let available = tokio::task::spawn_blocking(move || available_space(&target))
            .await
            .ok()
            .flatten();
        match available {
            Some(free) if free < self.min_free_disk_bytes => Err(PipelineError::DiskFull {
                path: dir.to_path_buf(),
                message: format!(
                    "{} bytes free, at least {} required",
                    free, self.min_free_disk_bytes
                ),
            }),
            Some(_) => Ok(()),
            None => {
                debug!("Could not determine free space for {}", dir.display());
                Ok(())
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        partial: &Path,
        on_progress: &dyn ProgressSink,
    ) -> PipelineResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, &e, self.read_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::UpstreamStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/html"));
        if is_html {
            return Err(PipelineError::MalformedResponse {
                url: url.to_string(),
                message: "received an HTML page instead of point-cloud data".to_string(),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = fs::File::create(partial)
            .await
            .map_err(|e| PipelineError::io("creating download file", e, partial))?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    return Err(PipelineError::Timeout {
                        operation: format!("reading {url}"),
                        after: self.read_timeout,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(transport_error(url, &e, self.read_timeout)),
                Ok(Some(Ok(chunk))) => chunk,
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::io("writing download file", e, partial))?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                let percent = (received as f64 / total as f64 * 100.0).min(100.0);
                on_progress.report(percent, "Downloading point cloud").await;
            }
        }
        file.flush()
            .await
            .map_err(|e| PipelineError::io("flushing download file", e, partial))?;
        file.sync_all()
            .await
            .map_err(|e| PipelineError::io("syncing download file", e, partial))?;

        if received == 0 {
            return Err(PipelineError::MalformedResponse {
                url: url.to_string(),
                message: "empty response body".to_string(),
            });
        }
        if let Some(total) = total {
            if received != total {
                return Err(PipelineError::Transport {
                    url: url.to_string(),
                    message: format!("connection closed after {received} of {total} bytes"),
                });
            }
        }
        Ok(received)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        tile: &Tile,
        sandbox: &ArtifactSandbox,
        raw_artifact: &str,
        on_progress: &dyn ProgressSink,
    ) -> PipelineResult<PathBuf> {
        if sandbox
            .file_size(raw_artifact)
            .await?
            .is_some_and(|size| size > 0)
        {
            debug!("Raw artifact for {} already present", tile.tile_id);
            on_progress.report(100.0, "Raw data already cached").await;
            return Ok(sandbox.resolve(raw_artifact)?);
        }

        let partial = sandbox.partial_path(raw_artifact).await?;
        self.ensure_disk_space(sandbox.base_dir()).await?;

        let mut last_error = None;
        for (index, source) in self.sources.iter().enumerate() {
            let url = source.render(tile);
            info!("Fetching tile {} from {}", tile.tile_id, url);

            match self.download(&url, &partial, on_progress).await {
                Ok(bytes) => {
                    let target = sandbox.promote_partial(raw_artifact).await?;
                    info!("Fetched tile {} ({} bytes)", tile.tile_id, bytes);
                    on_progress.report(100.0, "Download complete").await;
                    return Ok(target);
                }
                Err(e) => {
                    remove_partial(sandbox, raw_artifact).await;
                    let has_fallback = index + 1 < self.sources.len();
                    if has_fallback && is_source_failure(&e) {
                        warn!(
                            "Source {} failed for tile {}, trying the next source: {}",
                            url, tile.tile_id, e
                        );
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::invalid_input("no upstream source configured")))
    }
}

/// Failures a different source might not have.
fn is_source_failure(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::Transport { .. }
            | PipelineError::Timeout { .. }
            | PipelineError::UpstreamStatus { .. }
            | PipelineError::MalformedResponse { .. }
    )
}

fn transport_error(url: &str, error: &reqwest::Error, read_timeout: Duration) -> PipelineError {
    if error.is_timeout() {
        return PipelineError::Timeout {
            operation: format!("fetching {url}"),
            after: read_timeout,
        };
    }
    PipelineError::Transport {
        url: url.to_string(),
        message: error.to_string(),
    }
}

async fn remove_partial(sandbox: &ArtifactSandbox, raw_artifact: &str) {
    match sandbox.remove_file(&format!("{raw_artifact}.part")).await {
        Ok(true) => debug!("Removed partial download of {}", raw_artifact),
        Ok(false) => {}
        Err(e) => warn!("Failed to remove partial download of {}: {}", raw_artifact, e),
    }
}

/// Free bytes on the volume holding `path`.
fn available_space(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
