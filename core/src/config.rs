//! Configuration types for utxodex

use crate::error::IndexerError;
use crate::traits::IndexerResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Instance name for logging
    pub name: String,

    /// Data directory (ledger database and snapshot)
    pub data_dir: PathBuf,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Synchronization configuration
    pub sync: SyncConfig,

    /// Upstream full node RPC configuration
    pub rpc: RpcConfig,

    /// API configuration
    pub api: ApiConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            name: "utxodex".to_string(),
            data_dir: PathBuf::from("./data"),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            rpc: RpcConfig::default(),
            api: ApiConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl IndexerConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> IndexerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IndexerError::ConfigError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let config: IndexerConfig = serde_json::from_str(&content)
            .map_err(|e| IndexerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> IndexerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> IndexerResult<()> {
        if self.sync.checkpoint_interval == 0 {
            return Err(IndexerError::ConfigError(
                "sync.checkpoint_interval must be greater than zero".into(),
            ));
        }
        if self.sync.reorg_window < self.sync.checkpoint_interval {
            return Err(IndexerError::ConfigError(format!(
                "sync.reorg_window ({}) must cover sync.checkpoint_interval ({})",
                self.sync.reorg_window, self.sync.checkpoint_interval
            )));
        }
        if self.sync.event_buffer == 0 {
            return Err(IndexerError::ConfigError(
                "sync.event_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("snapshot.bin")
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Flush the database after every applied block
    pub flush_every_block: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_every_block: true,
        }
    }
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Checkpoint every K heights
    pub checkpoint_interval: u64,

    /// Delay before asking the block source again once at the tip
    pub poll_interval_ms: u64,

    /// First retry delay after a transient failure
    pub retry_delay_ms: u64,

    /// Upper bound of the retry backoff
    pub max_retry_delay_ms: u64,

    /// Events buffered between the block source driver and the synchronizer
    pub event_buffer: usize,

    /// Recent block hashes kept by the block source for divergence detection
    pub reorg_window: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 200,
            poll_interval_ms: 1000,
            retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            event_buffer: 16,
            reorg_window: 400,
        }
    }
}

/// Upstream full node RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// RPC endpoint
    pub url: String,

    /// Cookie file written by the full node (`~` is expanded)
    pub cookie_file: Option<String>,

    /// Explicit credentials, used when no cookie file is configured
    pub user: Option<String>,
    pub password: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:19998".to_string(),
            cookie_file: Some("~/.yerbascore/.cookie".to_string()),
            user: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Enable HTTP API
    pub enabled: bool,

    /// API listen address
    pub listen_addr: String,

    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8080".to_string(),
            enable_cors: true,
        }
    }
}
