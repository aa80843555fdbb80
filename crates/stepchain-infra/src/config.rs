//! Engine configuration loader for stepchain.
//!
//! Reads `config.toml` from the data directory (`~/.stepchain/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::Path;
use std::time::Duration;

use stepchain_core::workflow::worker::WorkerConfig;
use stepchain_types::config::EngineConfig;

use crate::filesystem::config_path;

/// Floor for the idle poll interval.
const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: a warning and the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Worker settings for workflow `name`.
///
/// Priority: `[workflows.<name>]` override, then the global value. The poll
/// interval never drops below 50 ms.
pub fn resolve_worker_config(config: &EngineConfig, name: &str) -> WorkerConfig {
    let overrides = config.workflows.get(name);

    let poll_interval_ms = overrides
        .and_then(|o| o.poll_interval_ms)
        .unwrap_or(config.poll_interval_ms)
        .max(MIN_POLL_INTERVAL_MS);
    let max_retries = overrides
        .and_then(|o| o.max_retries)
        .unwrap_or(config.max_retries);
    let stale_lease_secs = overrides
        .and_then(|o| o.stale_lease_secs)
        .or(config.stale_lease_secs);

    WorkerConfig {
        max_retries,
        poll_interval: Duration::from_millis(poll_interval_ms),
        stale_lease_after: stale_lease_secs.map(Duration::from_secs),
    }
}
