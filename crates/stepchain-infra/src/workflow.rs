//! SQLite-backed workflow construction.

use std::path::Path;

use stepchain_core::workflow::registry::StepRegistry;
use stepchain_core::workflow::{Workflow, WorkflowOptions};

use crate::sqlite::pool::DatabasePool;
use crate::sqlite::task::SqliteTaskRepository;

pub type SqliteWorkflow = Workflow<SqliteTaskRepository>;

/// Open `{data_dir}/workflow_{name}.db` and wire it to `registry`.
///
/// The worker is not started; call [`Workflow::start`] for that.
pub async fn create_workflow(
    name: &str,
    registry: StepRegistry,
    options: WorkflowOptions,
    data_dir: &Path,
) -> Result<SqliteWorkflow, sqlx::Error> {
    let pool = DatabasePool::open_workflow(data_dir, name).await?;
    tracing::debug!(
        workflow = name,
        data_dir = %data_dir.display(),
        steps = registry.len(),
        "opened workflow store"
    );
    Ok(Workflow::new(
        name,
        SqliteTaskRepository::new(pool),
        registry,
        options,
    ))
}
