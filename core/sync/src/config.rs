//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use folio_common::{Error, Result};
use folio_remote::ShapeRegistry;

use crate::backoff::Backoff;

/// Configuration for the flush driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Maximum items sent in one batch.
    pub batch_size: usize,
    /// Delay before the first retry when backoff is enabled.
    pub base_retry_delay: Duration,
    /// Cap on the backoff delay.
    pub max_retry_delay: Duration,
    /// Failed attempts after which an item is dropped.
    pub max_retries: u32,
    /// Timer period of the flush scheduler.
    pub flush_interval: Duration,
    /// Bearer token for the remote authority.
    pub auth_token: Option<String>,
    /// Hold failed items back exponentially instead of retrying every tick.
    pub exponential_backoff: bool,
    /// Keep applied items in the queue instead of compacting them away.
    pub retain_applied: bool,
}

impl FlushConfig {
    /// Backoff schedule applied to failed items, if enabled.
    pub fn backoff(&self) -> Option<Backoff> {
        self.exponential_backoff
            .then(|| Backoff::queue(self.base_retry_delay, self.max_retry_delay))
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            max_retries: 5,
            flush_interval: Duration::from_millis(5000),
            auth_token: None,
            exponential_backoff: false,
            retain_applied: false,
        }
    }
}

/// Configuration for change-feed subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Reconnect schedule after transport errors.
    pub reconnect: Backoff,
    /// Seed full-table subscriptions from the local mirror.
    pub seed_from_mirror: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect: Backoff::reconnect(),
            seed_from_mirror: true,
        }
    }
}

/// Configuration for pending-log cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Quiet period after a fresh feed update before cleanup runs.
    pub debounce: Duration,
    /// Only confirm a change once the synced row is at least as new.
    pub compare_update_timestamps: bool,
    /// Row field holding the last-modified timestamp.
    pub updated_at_field: String,
    /// Age after which failed pending entries are pruned.
    pub error_ttl: Duration,
    /// Period of the error sweep.
    pub error_sweep_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            compare_update_timestamps: true,
            updated_at_field: "updatedAt".to_string(),
            error_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            error_sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the local database. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    pub flush: FlushConfig,
    pub feed: FeedConfig,
    pub cleanup: CleanupConfig,
    /// Per-table wire shapes.
    pub shapes: ShapeRegistry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            flush: FlushConfig::default(),
            feed: FeedConfig::default(),
            cleanup: CleanupConfig::default(),
            shapes: ShapeRegistry::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Contents are not valid configuration JSON
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path.as_ref(), content).await?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flush.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.flush.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".to_string()));
        }
        if self.flush.flush_interval.is_zero() {
            return Err(Error::InvalidInput("flush_interval must be positive".to_string()));
        }
        Ok(())
    }
}
