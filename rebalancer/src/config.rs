//! TOML configuration loading and validation.
//!
//! Every section and key is optional; `Config::default()` runs the in-memory
//! backend with the standard retry policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use folio::RetryPolicy;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Upper bound on write attempts per batch.
const MAX_ATTEMPTS_LIMIT: u32 = 20;
/// Upper bound on worker threads.
const MAX_WORKERS: usize = 256;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub workers: WorkersConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: folio::retry::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: folio::retry::DEFAULT_BASE_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub queue_depth: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    Elasticsearch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub dir: String,
    pub ledger_file: String,
    pub transactions_file: String,
    pub url: String,
    pub requests_index: String,
    pub transactions_index: String,
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            dir: "./data".into(),
            ledger_file: "ledger.json".into(),
            transactions_file: "transactions.jsonl".into(),
            url: "http://localhost:9200".into(),
            requests_index: "rebalance_requests".into(),
            transactions_index: "rebalance_transactions".into(),
            timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    pub fn ledger_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.ledger_file)
    }

    pub fn transactions_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.transactions_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub audit_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".into(),
            audit_file: "audit.jsonl".into(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    fn validate(&self) -> Result<()> {
        if self.pipeline.max_attempts == 0 || self.pipeline.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(Error::Config(format!(
                "max_attempts must be in [1, {MAX_ATTEMPTS_LIMIT}]"
            )));
        }
        if self.workers.count == 0 || self.workers.count > MAX_WORKERS {
            return Err(Error::Config(format!(
                "workers.count must be in [1, {MAX_WORKERS}]"
            )));
        }
        if self.workers.queue_depth == 0 {
            return Err(Error::Config("workers.queue_depth must be > 0".into()));
        }
        match self.storage.backend {
            StorageBackend::Memory => {}
            StorageBackend::File => {
                if self.storage.ledger_file.is_empty() || self.storage.transactions_file.is_empty()
                {
                    return Err(Error::Config("storage file names must not be empty".into()));
                }
            }
            StorageBackend::Elasticsearch => {
                if self.storage.url.is_empty() {
                    return Err(Error::Config("storage.url must not be empty".into()));
                }
                if self.storage.requests_index.is_empty()
                    || self.storage.transactions_index.is_empty()
                {
                    return Err(Error::Config("index names must not be empty".into()));
                }
                if self.storage.timeout_secs == 0 {
                    return Err(Error::Config("storage.timeout_secs must be > 0".into()));
                }
            }
        }
        Ok(())
    }

    /// Retry policy for the transaction write path.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.pipeline.max_attempts,
            Duration::from_millis(self.pipeline.base_delay_ms),
        )
    }

    /// Full path to the audit log file.
    pub fn audit_path(&self) -> PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.audit_file)
    }
}
