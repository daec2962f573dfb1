//! # Engine Configuration
//!
//! Settings shared by every engine a host creates. Values come from
//! `Default`, from serialized config, or from `AUTOFLOW_*` environment
//! variables via [`EngineConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the checkpoint database
pub const DEFAULT_CHECKPOINT_DB: &str = ".autoflow/checkpoints.db";

/// Default number of execution attempts an engine remembers
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// Configuration for a workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite file holding checkpoints and the execution log
    #[serde(default)]
    pub checkpoint_db: Option<PathBuf>,
    /// Turn durable checkpoints on or off
    pub checkpoints_enabled: bool,
    /// Supervisor visits allowed before the run is terminated
    pub max_retries: u32,
    /// Per-node limit on domain logic, `None` disables the limit
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
    /// Most recent execution attempts kept per engine
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_db: Some(PathBuf::from(DEFAULT_CHECKPOINT_DB)),
            checkpoints_enabled: true,
            max_retries: 3,
            node_timeout_secs: Some(300),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `AUTOFLOW_*` environment variables
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary key lookup. Unparseable values are
    /// ignored with a warning.
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("AUTOFLOW_CHECKPOINT_DB") {
            self.checkpoint_db = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Some(flag) = lookup("AUTOFLOW_CHECKPOINTS") {
            match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => self.checkpoints_enabled = true,
                "0" | "false" | "off" | "no" => self.checkpoints_enabled = false,
                other => tracing::warn!(value = %other, "Ignoring invalid AUTOFLOW_CHECKPOINTS"),
            }
        }

        if let Some(raw) = lookup("AUTOFLOW_MAX_RETRIES") {
            match raw.parse() {
                Ok(n) => self.max_retries = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid AUTOFLOW_MAX_RETRIES"),
            }
        }

        if let Some(raw) = lookup("AUTOFLOW_NODE_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(0) => self.node_timeout_secs = None,
                Ok(n) => self.node_timeout_secs = Some(n),
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring invalid AUTOFLOW_NODE_TIMEOUT_SECS")
                }
            }
        }

        if let Some(raw) = lookup("AUTOFLOW_HISTORY_LIMIT") {
            match raw.parse() {
                Ok(n) => self.history_limit = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid AUTOFLOW_HISTORY_LIMIT"),
            }
        }

        self
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }
}
