//! Engine configuration types for stepchain.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls worker
//! polling, the redirect retry budget, and optional lease expiry. Individual
//! workflows may override any of these under `[workflows.<name>]`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the step-chain engine.
///
/// Loaded from `~/.stepchain/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Idle sleep between lease attempts, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cap on budgeted redirects per task before it is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Requeue RUNNING tasks untouched for this many seconds.
    /// Unset means no lease expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_lease_secs: Option<u64>,

    /// Per-workflow overrides keyed by workflow name.
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowOverrides>,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            stale_lease_secs: None,
            workflows: HashMap::new(),
        }
    }
}

/// Settings for one workflow that take priority over the global values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_lease_secs: Option<u64>,
}
