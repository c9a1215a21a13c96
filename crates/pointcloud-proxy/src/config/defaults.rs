//! Configuration default values
//!
//! All default values for configuration options live here so they can be
//! changed in one place.

// Environment
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "PCP_";

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SSE_KEEP_ALIVE: &str = "15s";

// State store defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/pointcloud-proxy.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

// Storage defaults
pub const DEFAULT_CACHE_DIR: &str = "./data/cache";
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 20 * 1024 * 1024 * 1024; // 20GiB
pub const DEFAULT_MIN_FREE_DISK_BYTES: u64 = 1024 * 1024 * 1024; // 1GiB

// Grid defaults (Swiss LV95, 1km tiles)
pub const DEFAULT_CELL_SIZE_M: f64 = 1000.0;
pub const DEFAULT_MIN_LAT: f64 = 45.8;
pub const DEFAULT_MAX_LAT: f64 = 47.9;
pub const DEFAULT_MIN_LON: f64 = 5.9;
pub const DEFAULT_MAX_LON: f64 = 10.6;

// Upstream defaults
pub const DEFAULT_PRIMARY_URL_TEMPLATE: &str = "https://data.geo.admin.ch/ch.swisstopo.swisssurface3d/swisssurface3d_{grid_x}-{grid_y}/swisssurface3d_{grid_x}-{grid_y}_2056_5728.laz";
pub const DEFAULT_CONNECT_TIMEOUT: &str = "10s";
pub const DEFAULT_READ_TIMEOUT: &str = "60s";
pub const DEFAULT_USER_AGENT: &str = concat!("pointcloud-proxy/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_RAW_EXTENSION: &str = "laz";

// Converter defaults
pub const DEFAULT_CONVERTER_COMMAND: &str = "PotreeConverter";
pub const DEFAULT_CROP_FLAG: &str = "--crop";
pub const DEFAULT_CROP_BUFFER_M: f64 = 50.0;
pub const DEFAULT_DESCRIPTOR_FILE: &str = "metadata.json";
pub const DEFAULT_PROGRESS_PATTERNS: &[&str] = &[
    r"(?i)INDEXING:\s*(\d+(?:\.\d+)?)\s*%",
    r"^\[\s*(\d+(?:\.\d+)?)\s*%",
    r"(\d+(?:\.\d+)?)\s*%",
];

// Job defaults
pub const DEFAULT_WORKER_COUNT: usize = 1;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY: &str = "5s";
pub const DEFAULT_RETRY_MAX_DELAY: &str = "1m";
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JOB_TIMEOUT: &str = "30m";
pub const DEFAULT_DEDUP_TTL: &str = "1h";
pub const DEFAULT_STATUS_TTL: &str = "24h";
pub const DEFAULT_POLL_INTERVAL: &str = "2s";
pub const DEFAULT_SHUTDOWN_GRACE: &str = "30s";

// Eviction defaults
pub const DEFAULT_EVICTION_ENABLED: bool = true;
pub const DEFAULT_EVICTION_INTERVAL: &str = "5m";
pub const DEFAULT_EVICTION_TARGET_RATIO: f64 = 0.8;
pub const DEFAULT_EVICTION_SAFETY_MARGIN: &str = "2m";
