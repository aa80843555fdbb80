//! Data directory layout for stepchain.
//!
//! Everything lives under one data directory: `config.toml` plus one
//! `workflow_{name}.db` per workflow.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPCHAIN_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPCHAIN_DATA_DIR` environment variable
/// 2. `~/.stepchain`
/// 3. `./.stepchain` when no home directory is known
pub fn resolve_data_dir() -> PathBuf {
    resolve_data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn resolve_data_dir_from(env_override: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = env_override.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepchain");
    }

    PathBuf::from(".stepchain")
}

/// Path of the global configuration file.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}
