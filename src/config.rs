//! Configuration for the off-chain engine
//!
//! The configuration object is threaded explicitly through the transport
//! and settlement components; there is no process-wide state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Registered on-ledger address of the local party
    pub local_address: String,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,

    /// Transport retry configuration
    pub retry: RetryConfig,

    /// Settlement configuration
    pub settlement: SettlementConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/offchain"),
            local_address: String::new(),
            service_name: "offchain-engine".to_string(),
            rocksdb: RocksDbConfig::default(),
            retry: RetryConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            enable_statistics: false,
        }
    }
}

/// Exponential backoff budget for the per-command retry loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First retry interval (milliseconds)
    pub initial_interval_ms: u64,

    /// Upper bound on any single interval (milliseconds)
    pub max_interval_ms: u64,

    /// Total budget before a command is marked stalled (milliseconds)
    pub max_elapsed_ms: u64,

    /// Interval growth factor
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,     // 30 seconds
            max_elapsed_ms: 300_000,     // 5 minutes
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Materialize the backoff policy for one send attempt series
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed_time: Some(Duration::from_millis(self.max_elapsed_ms)),
            multiplier: self.multiplier,
            ..Default::default()
        }
    }
}

/// Ledger submission and confirmation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Bound on waiting for execution confirmation (milliseconds)
    pub confirmation_timeout_ms: u64,

    /// Interval between confirmation polls (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 30_000, // 30 seconds
            poll_interval_ms: 500,
        }
    }
}

impl SettlementConfig {
    /// Confirmation deadline as a duration
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EngineConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Load defaults with environment variable overrides
    pub fn from_env() -> crate::Result<Self> {
        let mut config = EngineConfig::default();

        if let Ok(data_dir) = std::env::var("OFFCHAIN_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(address) = std::env::var("OFFCHAIN_LOCAL_ADDRESS") {
            config.local_address = address;
        }

        if let Ok(ms) = std::env::var("OFFCHAIN_RETRY_MAX_ELAPSED_MS") {
            config.retry.max_elapsed_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("invalid retry budget: {e}")))?;
        }

        Ok(config)
    }
}
