use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::parse_default;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between SSE keep-alive comments
    #[serde(default = "default_sse_keep_alive", with = "duration_serde::duration")]
    pub sse_keep_alive: Duration,
}

/// Shared key/value and sorted-set store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `memory://` for a process-local store, otherwise a sqlite or postgres URL
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of both cache tiers (`raw/` and `converted/` beneath it)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Quota across both tiers
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
    /// Downloads are refused when the cache volume has less free space than this
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionKind {
    /// Rigorous ellipsoidal transform
    Precise,
    /// Closed-form polynomial approximation, valid only inside the region
    Approximate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl RegionBounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

impl Default for RegionBounds {
    fn default() -> Self {
        Self {
            min_lat: DEFAULT_MIN_LAT,
            max_lat: DEFAULT_MAX_LAT,
            min_lon: DEFAULT_MIN_LON,
            max_lon: DEFAULT_MAX_LON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Tile edge length in metres
    #[serde(default = "default_cell_size")]
    pub cell_size_m: f64,
    /// Easting subtracted before flooring into grid indices
    #[serde(default)]
    pub origin_e: f64,
    /// Northing subtracted before flooring into grid indices
    #[serde(default)]
    pub origin_n: f64,
    #[serde(default)]
    pub region: RegionBounds,
    #[serde(default = "default_projection")]
    pub projection: ProjectionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// URL template with `{tile_id}`, `{grid_x}`, `{grid_y}`, `{min_e}`, `{min_n}` placeholders
    #[serde(default = "default_primary_url_template")]
    pub primary_url_template: String,
    /// Fallback source tried after a transport failure on the primary
    #[serde(default)]
    pub secondary_url_template: Option<String>,
    #[serde(default = "default_connect_timeout", with = "duration_serde::duration")]
    pub connect_timeout: Duration,
    /// Maximum silence between two chunks of a download
    #[serde(default = "default_read_timeout", with = "duration_serde::duration")]
    pub read_timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// File extension of the raw artifact
    #[serde(default = "default_raw_extension")]
    pub raw_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default = "default_converter_command")]
    pub command: String,
    /// Arguments placed before the input file
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Flag that introduces the crop bounds, followed by `min_e,min_n,max_e,max_n`
    #[serde(default = "default_crop_flag")]
    pub crop_flag: String,
    /// Metres added on every side of a crop box
    #[serde(default = "default_crop_buffer")]
    pub crop_buffer_m: f64,
    /// File whose presence marks a complete conversion
    #[serde(default = "default_descriptor_file")]
    pub descriptor_file: String,
    /// Regexes tried in order; the first capture group is the percentage
    #[serde(default = "default_progress_patterns")]
    pub progress_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay", with = "duration_serde::duration")]
    pub retry_initial_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "duration_serde::duration")]
    pub retry_max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Wall-clock limit for one fetch+convert run
    #[serde(default = "default_job_timeout", with = "duration_serde::duration")]
    pub job_timeout: Duration,
    #[serde(default = "default_dedup_ttl", with = "duration_serde::duration")]
    pub dedup_ttl: Duration,
    /// How long job records and last-known progress are retained
    #[serde(default = "default_status_ttl", with = "duration_serde::duration")]
    pub status_ttl: Duration,
    #[serde(default = "default_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_shutdown_grace", with = "duration_serde::duration")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    #[serde(default = "default_eviction_enabled")]
    pub enabled: bool,
    #[serde(default = "default_eviction_interval", with = "duration_serde::duration")]
    pub interval: Duration,
    /// Fraction of the quota a sweep reduces usage to
    #[serde(default = "default_eviction_target_ratio")]
    pub target_ratio: f64,
    /// Entries accessed within this window before a sweep starts are kept
    #[serde(default = "default_eviction_safety_margin", with = "duration_serde::duration")]
    pub safety_margin: Duration,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_sse_keep_alive() -> Duration {
    parse_default(DEFAULT_SSE_KEEP_ALIVE)
}
fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}
fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}
fn default_max_cache_bytes() -> u64 {
    DEFAULT_MAX_CACHE_BYTES
}
fn default_min_free_disk_bytes() -> u64 {
    DEFAULT_MIN_FREE_DISK_BYTES
}
fn default_cell_size() -> f64 {
    DEFAULT_CELL_SIZE_M
}
fn default_projection() -> ProjectionKind {
    ProjectionKind::Precise
}
fn default_primary_url_template() -> String {
    DEFAULT_PRIMARY_URL_TEMPLATE.to_string()
}
fn default_connect_timeout() -> Duration {
    parse_default(DEFAULT_CONNECT_TIMEOUT)
}
fn default_read_timeout() -> Duration {
    parse_default(DEFAULT_READ_TIMEOUT)
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_raw_extension() -> String {
    DEFAULT_RAW_EXTENSION.to_string()
}
fn default_converter_command() -> String {
    DEFAULT_CONVERTER_COMMAND.to_string()
}
fn default_crop_flag() -> String {
    DEFAULT_CROP_FLAG.to_string()
}
fn default_crop_buffer() -> f64 {
    DEFAULT_CROP_BUFFER_M
}
fn default_descriptor_file() -> String {
    DEFAULT_DESCRIPTOR_FILE.to_string()
}
fn default_progress_patterns() -> Vec<String> {
    DEFAULT_PROGRESS_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retry_initial_delay() -> Duration {
    parse_default(DEFAULT_RETRY_INITIAL_DELAY)
}
fn default_retry_max_delay() -> Duration {
    parse_default(DEFAULT_RETRY_MAX_DELAY)
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_job_timeout() -> Duration {
    parse_default(DEFAULT_JOB_TIMEOUT)
}
fn default_dedup_ttl() -> Duration {
    parse_default(DEFAULT_DEDUP_TTL)
}
fn default_status_ttl() -> Duration {
    parse_default(DEFAULT_STATUS_TTL)
}
fn default_poll_interval() -> Duration {
    parse_default(DEFAULT_POLL_INTERVAL)
}
fn default_shutdown_grace() -> Duration {
    parse_default(DEFAULT_SHUTDOWN_GRACE)
}
fn default_eviction_enabled() -> bool {
    DEFAULT_EVICTION_ENABLED
}
fn default_eviction_interval() -> Duration {
    parse_default(DEFAULT_EVICTION_INTERVAL)
}
fn default_eviction_target_ratio() -> f64 {
    DEFAULT_EVICTION_TARGET_RATIO
}
fn default_eviction_safety_margin() -> Duration {
    parse_default(DEFAULT_EVICTION_SAFETY_MARGIN)
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sse_keep_alive: default_sse_keep_alive(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_bytes: default_max_cache_bytes(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size_m: default_cell_size(),
            origin_e: 0.0,
            origin_n: 0.0,
            region: RegionBounds::default(),
            projection: default_projection(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            primary_url_template: default_primary_url_template(),
            secondary_url_template: None,
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
            raw_extension: default_raw_extension(),
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            command: default_converter_command(),
            extra_args: Vec::new(),
            crop_flag: default_crop_flag(),
            crop_buffer_m: default_crop_buffer(),
            descriptor_file: default_descriptor_file(),
            progress_patterns: default_progress_patterns(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            job_timeout: default_job_timeout(),
            dedup_ttl: default_dedup_ttl(),
            status_ttl: default_status_ttl(),
            poll_interval: default_poll_interval(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_eviction_enabled(),
            interval: default_eviction_interval(),
            target_ratio: default_eviction_target_ratio(),
            safety_margin: default_eviction_safety_margin(),
        }
    }
}

impl Config {
    /// Load using `CONFIG_FILE` (default `config.toml`).
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Load defaults, then the TOML file, then `PCP_`-prefixed environment variables.
    ///
    /// A missing file is created with the default configuration.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let path = Path::new(config_file);
        if !path.exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            std::fs::write(path, contents)?;
            info!("Created default config file: {}", config_file);
        }

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if !(self.grid.cell_size_m.is_finite() && self.grid.cell_size_m > 0.0) {
            bail!("grid.cell_size_m must be a positive number");
        }
        let region = &self.grid.region;
        if region.min_lat >= region.max_lat || region.min_lon >= region.max_lon {
            bail!("grid.region bounds are inverted or empty");
        }
        if !(self.eviction.target_ratio > 0.0 && self.eviction.target_ratio <= 1.0) {
            bail!("eviction.target_ratio must be within (0, 1]");
        }
        if self.upstream.primary_url_template.trim().is_empty() {
            bail!("upstream.primary_url_template cannot be empty");
        }
        if let Some(secondary) = &self.upstream.secondary_url_template {
            if secondary.trim().is_empty() {
                bail!("upstream.secondary_url_template cannot be empty when set");
            }
        }
        if self.converter.command.trim().is_empty() {
            bail!("converter.command cannot be empty");
        }
        if self.converter.descriptor_file.contains('/') || self.converter.descriptor_file.is_empty()
        {
            bail!("converter.descriptor_file must be a plain file name");
        }
        if self.jobs.max_attempts == 0 {
            bail!("jobs.max_attempts must be at least 1");
        }
        if self.jobs.worker_count == 0 {
            bail!("jobs.worker_count must be at least 1");
        }
        Ok(())
    }
}
