//! Configuration for the event log and sync engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory holding the clock file, log partitions, index and queue
    pub data_dir: PathBuf,

    /// Log configuration
    pub log: LogConfig,

    /// Offline queue configuration
    pub queue: QueueConfig,

    /// Sync scheduler configuration
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/flowledger"),
            log: LogConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Durable log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Flush-to-disk on every append
    pub fsync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            fsync_on_append: true,
        }
    }
}

/// Offline queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Hard cap on pending entries; enqueue past this is rejected visibly
    pub capacity: usize,

    /// Failed deliveries beyond this move to the dead-letter table
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_retries: 5,
        }
    }
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between scheduled drain passes
    pub interval_secs: u64,

    /// Maximum events per batch call
    pub batch_size: usize,

    /// Minimum milliseconds between consecutive batch calls (rate limit)
    pub min_batch_interval_ms: u64,

    /// Backoff floor (milliseconds)
    pub backoff_floor_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_ceiling_ms: u64,

    /// Timeout for one batch transport call (seconds)
    pub request_timeout_secs: u64,

    /// Budget for the best-effort flush at shutdown (milliseconds)
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,             // 5 minutes
            batch_size: 1_000,
            min_batch_interval_ms: 1_000,
            backoff_floor_ms: 500,
            backoff_ceiling_ms: 30_000,
            request_timeout_secs: 30,
            shutdown_flush_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Clock file path
    pub fn clock_path(&self) -> PathBuf {
        self.data_dir.join("clock.json")
    }

    /// Directory of date-partitioned log files
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    /// Derived index path (safely deletable)
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.db")
    }

    /// Durable queue path (separate from the log)
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load defaults with environment variable overrides
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("FLOWLEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(secs) = std::env::var("FLOWLEDGER_SYNC_INTERVAL_SECS") {
            config.sync.interval_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("Bad sync interval: {}", e)))?;
        }

        if let Ok(cap) = std::env::var("FLOWLEDGER_QUEUE_CAPACITY") {
            config.queue.capacity = cap
                .parse()
                .map_err(|e| crate::Error::Config(format!("Bad queue capacity: {}", e)))?;
        }

        Ok(config)
    }
}
