//! Application state shared by CLI commands.
//!
//! AppState resolves the data directory and engine configuration once; each
//! command then opens the database of the workflow it targets.

use std::path::PathBuf;

use anyhow::{Context, bail};
use stepchain_core::workflow::worker::WorkerConfig;
use stepchain_infra::config::{load_engine_config, resolve_worker_config};
use stepchain_infra::filesystem::resolve_data_dir;
use stepchain_infra::sqlite::pool::{DatabasePool, workflow_db_path};
use stepchain_infra::sqlite::task::SqliteTaskRepository;
use stepchain_types::config::EngineConfig;

#[derive(Debug, Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
}

impl AppState {
    /// Resolve the data directory (explicit flag first) and load `config.toml`.
    pub async fn init(data_dir_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir_override.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self { data_dir, config })
    }

    /// Open the task store of `workflow`, creating it if needed.
    pub async fn open_repo(&self, workflow: &str) -> anyhow::Result<SqliteTaskRepository> {
        validate_workflow_name(workflow)?;
        let pool = DatabasePool::open_workflow(&self.data_dir, workflow)
            .await
            .with_context(|| {
                format!(
                    "Failed to open {}",
                    workflow_db_path(&self.data_dir, workflow).display()
                )
            })?;
        Ok(SqliteTaskRepository::new(pool))
    }

    /// Effective worker settings for `workflow`.
    pub fn worker_config(&self, workflow: &str) -> WorkerConfig {
        resolve_worker_config(&self.config, workflow)
    }
}

/// Workflow names become file names: letters, digits, `-` and `_` only.
pub fn validate_workflow_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("Workflow name must not be empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("Invalid workflow name '{name}': use letters, digits, '-' or '_'");
    }
    Ok(())
}
