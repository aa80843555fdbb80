//! Task queue: creation, leasing, and the three state transitions.
//!
//! Wraps a `TaskRepository` with the persistence rules of a step chain.
//! Each transition takes the task snapshot returned by the lease, appends
//! exactly one history entry to it, and writes it back only if the stored
//! row is still `RUNNING` under the same `lease_id`. That compare-and-set
//! keeps `COMPLETED` and `FAILED` terminal and stops a worker whose lease
//! was requeued from overwriting the progress of the next holder.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use stepchain_types::error::RepositoryError;
use stepchain_types::task::{HistoryEntry, Task, TaskAux, TaskFilter, TaskStatus};
use uuid::Uuid;

use crate::repository::task::TaskRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    /// Transitions only apply to a task this worker holds the lease on.
    #[error("task {id} is {status}, not RUNNING")]
    NotRunning { id: Uuid, status: TaskStatus },

    /// The task was requeued and leased again after this snapshot was taken.
    #[error("task {id} is held by a newer lease")]
    LeaseLost { id: Uuid },
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Queue over one workflow's task table.
///
/// `step_count` is the length of the workflow's registry; it decides whether
/// a successful step completes the task or advances it.
pub struct TaskQueue<R: TaskRepository> {
    repo: Arc<R>,
    step_count: usize,
}

impl<R: TaskRepository> Clone for TaskQueue<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            step_count: self.step_count,
        }
    }
}

impl<R: TaskRepository> TaskQueue<R> {
    pub fn new(repo: Arc<R>, step_count: usize) -> Self {
        Self { repo, step_count }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Caller-facing
    // -----------------------------------------------------------------------

    /// Enqueue a new task at step 0.
    pub async fn start_chain(&self, initial_input: Value) -> Result<Uuid, QueueError> {
        self.start_chain_with(initial_input, TaskAux::default()).await
    }

    /// Enqueue a new task with its auxiliary slots pre-filled.
    pub async fn start_chain_with(
        &self,
        initial_input: Value,
        aux: TaskAux,
    ) -> Result<Uuid, QueueError> {
        let task = Task::new(initial_input, aux);
        self.repo.insert_task(&task).await?;
        tracing::debug!(task_id = %task.id, "task enqueued");
        Ok(task.id)
    }

    /// Current state of a task, `None` if the id is unknown.
    pub async fn get_task_status(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        Ok(self.repo.get_task(&id).await?)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        Ok(self.repo.list_tasks(filter).await?)
    }

    pub async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, QueueError> {
        Ok(self.repo.count_by_status().await?)
    }

    // -----------------------------------------------------------------------
    // Worker-facing
    // -----------------------------------------------------------------------

    /// Lease the oldest PENDING task. `None` means the queue is idle.
    pub async fn find_and_lock_task(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.repo.lease_next_pending(Utc::now()).await?)
    }

    /// Record a successful step and advance (or complete) the task.
    pub async fn update_task_success(
        &self,
        task: &Task,
        step_key: &str,
        output: Value,
        aux: TaskAux,
    ) -> Result<Task, QueueError> {
        let (mut next, lease_id) = self.leased_copy(task, aux)?;
        next.history.push(HistoryEntry::success(
            task.current_step,
            step_key,
            task.input_for_current_step.clone(),
            output.clone(),
        ));

        if task.current_step + 1 >= self.step_count {
            next.status = TaskStatus::Completed;
        } else {
            next.status = TaskStatus::Pending;
            next.current_step = task.current_step + 1;
            next.input_for_current_step = output;
        }

        self.commit(next, lease_id).await
    }

    /// Record a redirect and point the task at `target`.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_goto_step(
        &self,
        task: &Task,
        step_key: &str,
        target: usize,
        new_input: Value,
        note: String,
        new_retry_count: u32,
        aux: TaskAux,
    ) -> Result<Task, QueueError> {
        let (mut next, lease_id) = self.leased_copy(task, aux)?;
        next.history
            .push(HistoryEntry::redirect(task.current_step, step_key, note));
        next.status = TaskStatus::Pending;
        next.current_step = target;
        next.input_for_current_step = new_input;
        next.retry_count = new_retry_count;

        self.commit(next, lease_id).await
    }

    /// Record a failure. Terminal.
    pub async fn update_task_failure(
        &self,
        task: &Task,
        step_key: &str,
        error: &str,
        aux: TaskAux,
    ) -> Result<Task, QueueError> {
        let (mut next, lease_id) = self.leased_copy(task, aux)?;
        next.history
            .push(HistoryEntry::failure(task.current_step, step_key, error));
        next.status = TaskStatus::Failed;

        self.commit(next, lease_id).await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Return every RUNNING task to PENDING.
    pub async fn recover_running(&self) -> Result<u64, QueueError> {
        let count = self.repo.reset_running().await?;
        if count > 0 {
            tracing::info!(count, "reset running tasks to pending");
        }
        Ok(count)
    }

    /// Return RUNNING tasks whose lease is older than `older_than` to PENDING.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let count = self.repo.requeue_stale(stale_cutoff(older_than)).await?;
        if count > 0 {
            tracing::warn!(
                count,
                older_than_secs = older_than.as_secs(),
                "requeued stale running tasks"
            );
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Copy of a leased snapshot ready for its next state, plus the lease the
    /// write must be checked against. Every transition ends the lease.
    fn leased_copy(&self, task: &Task, aux: TaskAux) -> Result<(Task, Uuid), QueueError> {
        let lease_id = match (task.status, task.lease_id) {
            (TaskStatus::Running, Some(lease_id)) => lease_id,
            (TaskStatus::Running, None) => return Err(QueueError::LeaseLost { id: task.id }),
            (status, _) => return Err(QueueError::NotRunning { id: task.id, status }),
        };
        let mut next = task.clone();
        next.aux = aux;
        next.updated_at = Utc::now();
        next.lease_id = None;
        Ok((next, lease_id))
    }

    async fn commit(&self, task: Task, lease_id: Uuid) -> Result<Task, QueueError> {
        match self.repo.update_task(&task, lease_id).await {
            Ok(()) => {
                tracing::debug!(
                    task_id = %task.id,
                    status = %task.status,
                    current_step = task.current_step,
                    "task updated"
                );
                Ok(task)
            }
            Err(RepositoryError::NotFound) => Err(QueueError::TaskNotFound(task.id)),
            Err(RepositoryError::Conflict(_)) => match self.repo.get_task(&task.id).await? {
                Some(stored) if stored.status == TaskStatus::Running => {
                    Err(QueueError::LeaseLost { id: task.id })
                }
                Some(stored) => Err(QueueError::NotRunning {
                    id: task.id,
                    status: stored.status,
                }),
                None => Err(QueueError::TaskNotFound(task.id)),
            },
            Err(e) => Err(e.into()),
        }
    }
}

fn stale_cutoff(older_than: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(older_than)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
