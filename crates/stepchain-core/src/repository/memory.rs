//! In-memory `TaskRepository`.
//!
//! Holds every task behind one async mutex, so the PENDING -> RUNNING lease
//! is a select-and-flip under a single guard. Clones share the same table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepchain_types::error::RepositoryError;
use stepchain_types::task::{Task, TaskFilter, TaskStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::task::TaskRepository;

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRepository for InMemoryTaskRepository {
    async fn insert_task(&self, task: &Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(RepositoryError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn lease_next_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, RepositoryError> {
        let mut tasks = self.tasks.lock().await;
        let oldest = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| (t.created_at, t.id))
            .map(|t| t.id);

        Ok(oldest.and_then(|id| {
            tasks.get_mut(&id).map(|task| {
                task.status = TaskStatus::Running;
                task.updated_at = now;
                task.lease_id = Some(Uuid::now_v7());
                task.clone()
            })
        }))
    }

    async fn update_task(&self, task: &Task, lease_id: Uuid) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.get_mut(&task.id).ok_or(RepositoryError::NotFound)?;
        if stored.status != TaskStatus::Running || stored.lease_id != Some(lease_id) {
            return Err(RepositoryError::Conflict(format!(
                "task {} is {}, not held by lease {lease_id}",
                task.id, stored.status
            )));
        }
        *stored = task.clone();
        Ok(())
    }

    async fn reset_running(&self) -> Result<u64, RepositoryError> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for task in tasks.values_mut().filter(|t| t.status == TaskStatus::Running) {
            task.status = TaskStatus::Pending;
            task.updated_at = now;
            task.lease_id = None;
            count += 1;
        }
        Ok(count)
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Running && t.updated_at < cutoff)
        {
            task.status = TaskStatus::Pending;
            task.updated_at = now;
            task.lease_id = None;
            count += 1;
        }
        Ok(count)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        matching.truncate(filter.limit as usize);
        Ok(matching)
    }

    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, RepositoryError> {
        let tasks = self.tasks.lock().await;
        Ok(TaskStatus::ALL
            .into_iter()
            .filter_map(|status| {
                let n = tasks.values().filter(|t| t.status == status).count() as u64;
                (n > 0).then_some((status, n))
            })
            .collect())
    }

    async fn close(&self) {}
}
