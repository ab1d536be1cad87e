//! WolfStore Configuration
//!
//! This module provides configuration structures for the WolfStore
//! storage node and its tablet clone engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageMedium;

/// Main WolfStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Storage roots
    pub storage: StorageConfig,

    /// Clone engine configuration
    #[serde(default)]
    pub clone: CloneConfig,

    /// Snapshot service configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Snapshot RPC server configuration
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Snapshot file HTTP server configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Host other nodes use to reach this node
    #[serde(default = "default_host")]
    pub host: String,

    /// Cluster token, required on every snapshot file request
    #[serde(default)]
    pub token: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root directories
    pub paths: Vec<StorePathConfig>,

    /// Disk usage percentage above which a path counts as full
    #[serde(default = "default_flood_stage_usage_percent")]
    pub flood_stage_usage_percent: u32,

    /// Remaining bytes below which a path counts as full
    #[serde(default = "default_flood_stage_left_capacity_bytes")]
    pub flood_stage_left_capacity_bytes: u64,

    /// Number of shard directories under each root
    #[serde(default = "default_max_shard_num")]
    pub max_shard_num: u64,
}

/// One storage root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorePathConfig {
    /// Root directory
    pub path: PathBuf,

    /// Storage medium of the root
    #[serde(default)]
    pub medium: StorageMedium,

    /// Capacity override in bytes (default: detect from the disk)
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// Clone engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Use the batched download API when the remote supports it
    #[serde(default = "default_true")]
    pub enable_batch_download: bool,

    /// Lowest expected download speed, used to size per-file timeouts
    #[serde(default = "default_download_low_speed_limit_kbps")]
    pub download_low_speed_limit_kbps: u64,

    /// Lower bound of a per-file download timeout in seconds
    #[serde(default = "default_download_low_speed_time_secs")]
    pub download_low_speed_time_secs: u64,

    /// Attempts per HTTP operation
    #[serde(default = "default_download_file_max_retry")]
    pub download_file_max_retry: u32,

    /// Timeout for listing a remote snapshot directory
    #[serde(default = "default_list_remote_file_timeout_secs")]
    pub list_remote_file_timeout_secs: u64,

    /// Timeout for fetching a remote file length
    #[serde(default = "default_get_length_timeout_secs")]
    pub get_length_timeout_secs: u64,

    /// Maximum clone tasks running at once
    #[serde(default = "default_max_concurrent_clones")]
    pub max_concurrent_clones: usize,

    /// Connect timeout for snapshot RPCs in milliseconds
    #[serde(default = "default_rpc_connect_timeout_ms")]
    pub rpc_connect_timeout_ms: u64,

    /// Request timeout for snapshot RPCs in seconds
    #[serde(default = "default_rpc_request_timeout_secs")]
    pub rpc_request_timeout_secs: u64,
}

/// Snapshot service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Default expiry of a snapshot nobody released
    #[serde(default = "default_snapshot_expire_secs")]
    pub default_expire_secs: u64,

    /// Interval between expired snapshot sweeps
    #[serde(default = "default_snapshot_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Snapshot RPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// RPC bind address
    #[serde(default = "default_rpc_address")]
    pub bind_address: String,
}

/// Snapshot file HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Enable the HTTP file server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_http_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_flood_stage_usage_percent() -> u32 {
    90
}

fn default_flood_stage_left_capacity_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_shard_num() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_download_low_speed_limit_kbps() -> u64 {
    50
}

fn default_download_low_speed_time_secs() -> u64 {
    300
}

fn default_download_file_max_retry() -> u32 {
    3
}

fn default_list_remote_file_timeout_secs() -> u64 {
    15
}

fn default_get_length_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_clones() -> usize {
    3
}

fn default_rpc_connect_timeout_ms() -> u64 {
    5000
}

fn default_rpc_request_timeout_secs() -> u64 {
    60
}

fn default_snapshot_expire_secs() -> u64 {
    3600
}

fn default_snapshot_sweep_interval_secs() -> u64 {
    300
}

fn default_rpc_address() -> String {
    "0.0.0.0:9060".to_string()
}

fn default_http_address() -> String {
    "0.0.0.0:8040".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            enable_batch_download: true,
            download_low_speed_limit_kbps: default_download_low_speed_limit_kbps(),
            download_low_speed_time_secs: default_download_low_speed_time_secs(),
            download_file_max_retry: default_download_file_max_retry(),
            list_remote_file_timeout_secs: default_list_remote_file_timeout_secs(),
            get_length_timeout_secs: default_get_length_timeout_secs(),
            max_concurrent_clones: default_max_concurrent_clones(),
            rpc_connect_timeout_ms: default_rpc_connect_timeout_ms(),
            rpc_request_timeout_secs: default_rpc_request_timeout_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            default_expire_secs: default_snapshot_expire_secs(),
            sweep_interval_secs: default_snapshot_sweep_interval_secs(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_address: default_rpc_address(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_http_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl StorageConfig {
    /// Storage config with a single root and default thresholds
    pub fn single(path: PathBuf) -> Self {
        Self {
            paths: vec![StorePathConfig {
                path,
                medium: StorageMedium::default(),
                capacity_bytes: None,
            }],
            flood_stage_usage_percent: default_flood_stage_usage_percent(),
            flood_stage_left_capacity_bytes: default_flood_stage_left_capacity_bytes(),
            max_shard_num: default_max_shard_num(),
        }
    }
}

impl CloneConfig {
    /// Snapshot RPC connect timeout
    pub fn rpc_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_connect_timeout_ms)
    }

    /// Snapshot RPC request timeout
    pub fn rpc_request_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_request_timeout_secs)
    }

    pub fn list_remote_file_timeout(&self) -> Duration {
        Duration::from_secs(self.list_remote_file_timeout_secs)
    }

    pub fn get_length_timeout(&self) -> Duration {
        Duration::from_secs(self.get_length_timeout_secs)
    }

    /// Download timeout for a file of `file_size` bytes
    pub fn download_timeout(&self, file_size: u64) -> Duration {
        let kbps = self.download_low_speed_limit_kbps.max(1);
        let estimate = file_size / kbps / 1024;
        Duration::from_secs(estimate.max(self.download_low_speed_time_secs))
    }
}

impl LoggingConfig {
    /// This config with any level or format given on the command line
    pub fn with_overrides(mut self, level: Option<String>, format: Option<String>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(format) = format {
            self.format = format;
        }
        self
    }

    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

impl WolfStoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.storage.paths.is_empty() {
            return Err(crate::Error::Config(
                "storage.paths must contain at least one root".into(),
            ));
        }

        if self.storage.flood_stage_usage_percent > 100 {
            return Err(crate::Error::Config(
                "storage.flood_stage_usage_percent must be <= 100".into(),
            ));
        }

        if self.storage.max_shard_num == 0 {
            return Err(crate::Error::Config(
                "storage.max_shard_num must be positive".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        if self.clone.max_concurrent_clones == 0 {
            return Err(crate::Error::Config(
                "clone.max_concurrent_clones must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Snapshot sweep interval as Duration
    pub fn snapshot_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot.sweep_interval_secs)
    }

    /// Render a starter configuration file
    pub fn template(node_id: &str, data_dir: &std::path::Path) -> String {
        format!(
            r#"[node]
id = "{node_id}"
host = "127.0.0.1"
token = ""

[storage]
flood_stage_usage_percent = 90

[[storage.paths]]
path = "{data_dir}"
medium = "hdd"

[clone]
enable_batch_download = true
max_concurrent_clones = 3

[rpc]
bind_address = "0.0.0.0:9060"

[http]
bind_address = "0.0.0.0:8040"

[logging]
level = "info"
format = "pretty"
"#,
            node_id = node_id,
            data_dir = data_dir.display(),
        )
    }
}
