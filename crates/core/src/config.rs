//! Pipeline configuration via `txnpipe.toml`
//!
//! Values are read once when the manager is created. A missing file means
//! defaults; to change settings, edit the file and restart the client.

use crate::error::{TxnError, TxnResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name looked up next to the client's data directory.
pub const CONFIG_FILE_NAME: &str = "txnpipe.toml";

fn default_max_outstanding_batches() -> usize {
    4
}

fn default_max_pending_batches() -> usize {
    88
}

fn default_max_batch_size_bytes() -> usize {
    128 * 1024
}

fn default_completed_ack_flush_interval_ms() -> u64 {
    5000
}

fn default_folding_enabled() -> bool {
    true
}

/// Folding rules for merging commits into one wire transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FoldingConfig {
    /// Fold commits that touch the same objects (default: true)
    #[serde(default = "default_folding_enabled")]
    pub enabled: bool,
    /// Transactions touching more objects than this are never folded (0 = no limit)
    #[serde(default)]
    pub object_limit: usize,
    /// Transactions holding more locks than this are never folded (0 = no limit)
    #[serde(default)]
    pub lock_limit: usize,
    /// Log every folding decision at debug level
    #[serde(default)]
    pub debug: bool,
}

impl Default for FoldingConfig {
    fn default() -> Self {
        Self {
            enabled: default_folding_enabled(),
            object_limit: 0,
            lock_limit: 0,
            debug: false,
        }
    }
}

impl FoldingConfig {
    /// Folding switched off entirely
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Pipeline configuration loaded from `txnpipe.toml`.
///
/// # Example
///
/// ```toml
/// max_outstanding_batches = 4
/// max_pending_batches = 88
/// ack_on_exit_timeout_ms = 30000
///
/// [folding]
/// enabled = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Batches allowed on the wire before a batch acknowledgment is needed.
    #[serde(default = "default_max_outstanding_batches")]
    pub max_outstanding_batches: usize,
    /// Closed batches the sequencer queues before committers block.
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,
    /// Byte estimate at which the open batch is closed.
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: usize,
    /// Commits (before folding) at which the open batch is closed (0 = no limit).
    #[serde(default)]
    pub max_transactions_per_batch: usize,
    /// Shutdown drain: absent = no wait, 0 = wait until drained, N = wait at most N ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_on_exit_timeout_ms: Option<u64>,
    /// Period of the completed-transaction low-water-mark report.
    #[serde(default = "default_completed_ack_flush_interval_ms")]
    pub completed_ack_flush_interval_ms: u64,
    /// Folding rules.
    #[serde(default)]
    pub folding: FoldingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_outstanding_batches: default_max_outstanding_batches(),
            max_pending_batches: default_max_pending_batches(),
            max_batch_size_bytes: default_max_batch_size_bytes(),
            max_transactions_per_batch: 0,
            ack_on_exit_timeout_ms: None,
            completed_ack_flush_interval_ms: default_completed_ack_flush_interval_ms(),
            folding: FoldingConfig::default(),
        }
    }
}

/// How long shutdown waits for outstanding acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOnExit {
    /// Do not wait
    Disabled,
    /// Wait until every transaction is acknowledged
    Unbounded,
    /// Wait at most this long
    Bounded(Duration),
}

impl PipelineConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if a ceiling is zero.
    pub fn validate(&self) -> TxnResult<()> {
        if self.max_outstanding_batches == 0 {
            return Err(TxnError::config(
                "max_outstanding_batches must be at least 1",
            ));
        }
        if self.max_pending_batches == 0 {
            return Err(TxnError::config("max_pending_batches must be at least 1"));
        }
        if self.max_batch_size_bytes == 0 {
            return Err(TxnError::config("max_batch_size_bytes must be at least 1"));
        }
        if self.completed_ack_flush_interval_ms == 0 {
            return Err(TxnError::config(
                "completed_ack_flush_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }

    /// Interpret `ack_on_exit_timeout_ms`.
    pub fn ack_on_exit(&self) -> AckOnExit {
        match self.ack_on_exit_timeout_ms {
            None => AckOnExit::Disabled,
            Some(0) => AckOnExit::Unbounded,
            Some(ms) => AckOnExit::Bounded(Duration::from_millis(ms)),
        }
    }

    /// Low-water-mark report period.
    pub fn completed_ack_flush_interval(&self) -> Duration {
        Duration::from_millis(self.completed_ack_flush_interval_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# txnpipe configuration
#
# Batches on the wire awaiting a batch acknowledgment (default: 4)
max_outstanding_batches = 4

# Closed batches queued in the sequencer before committers block (default: 88)
max_pending_batches = 88

# Close the open batch once its estimated size reaches this many bytes
max_batch_size_bytes = 131072

# Close the open batch after this many commits, 0 = no limit
max_transactions_per_batch = 0

# Shutdown drain. Leave unset to exit without waiting,
# 0 = wait until every transaction is acknowledged, N = wait at most N ms.
# ack_on_exit_timeout_ms = 30000

# Period of the completed-transaction low-water-mark report
completed_ack_flush_interval_ms = 5000

[folding]
enabled = true
object_limit = 0
lock_limit = 0
debug = false
"#
    }

    /// Parse and validate config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or fails validation.
    pub fn from_toml_str(content: &str) -> TxnResult<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| TxnError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> TxnResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TxnError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TxnError::Config(msg) => {
                TxnError::config(format!("{} (in '{}')", msg, path.display()))
            }
            other => other,
        })
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> TxnResult<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the commented default file if nothing exists at `path`.
    pub fn write_default_if_missing(path: &Path) -> TxnResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TxnError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TxnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxnError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
