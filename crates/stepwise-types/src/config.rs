//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `stepwise.toml` that controls
//! retry defaults, observer channel sizing, subscriber nesting and storage.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryConfig;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.stepwise/stepwise.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy applied to steps (and workflows) that declare none.
    #[serde(default)]
    pub default_retry: RetryConfig,

    /// Capacity of each run's observer channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Maximum nesting of subscriber sub-runs.
    #[serde(default = "default_max_subscriber_depth")]
    pub max_subscriber_depth: u32,

    /// Snapshot database URL; derived from the data directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_subscriber_depth() -> u32 {
    8
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryConfig::default(),
            event_capacity: default_event_capacity(),
            max_subscriber_depth: default_max_subscriber_depth(),
            database_url: None,
            log_filter: default_log_filter(),
            log_json: false,
        }
    }
}
