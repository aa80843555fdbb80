//! Task repository trait definition.
//!
//! Defines the durable store behind a `TaskQueue`: point reads and writes
//! plus the atomic lease that hands one PENDING task to exactly one worker.
//! The infrastructure layer (stepchain-infra) implements this trait with
//! SQLite persistence.

use chrono::{DateTime, Utc};
use stepchain_types::error::RepositoryError;
use stepchain_types::task::{Task, TaskFilter, TaskStatus};
use uuid::Uuid;

/// Repository trait for task persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskRepository: Send + Sync {
    /// Insert a new task row.
    fn insert_task(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a task by its UUID.
    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Atomically select the oldest PENDING task, flip it to RUNNING, stamp
    /// `updated_at = now` and give it a fresh `lease_id`.
    ///
    /// Two concurrent callers must never both receive the same task. Oldest
    /// means smallest `created_at`, ties broken by id.
    fn lease_next_pending(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Overwrite every column of `task`, provided the stored row is still
    /// RUNNING under `lease_id`.
    ///
    /// Returns `NotFound` if the row is missing and `Conflict` if its status
    /// has moved on or a newer lease holds it.
    fn update_task(
        &self,
        task: &Task,
        lease_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Flip every RUNNING task back to PENDING and drop its lease. Returns the
    /// number reset.
    fn reset_running(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Flip RUNNING tasks whose `updated_at` is before `cutoff` back to
    /// PENDING and drop their leases.
    fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// List tasks, newest first.
    fn list_tasks(
        &self,
        filter: &TaskFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Number of tasks per status (statuses with no tasks are omitted).
    fn count_by_status(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(TaskStatus, u64)>, RepositoryError>> + Send;

    /// Release underlying resources.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}
