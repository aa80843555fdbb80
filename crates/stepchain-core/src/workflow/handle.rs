//! The view of a task a step receives.
//!
//! `TaskHandle` is read-only with respect to progress (`current_step`,
//! `status` and `history` belong to the queue) but lets a step fill in the
//! auxiliary slots. The worker reads the slots back after the step returns
//! and persists them with whichever transition follows.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use stepchain_types::task::{HistoryEntry, StepRef, Task, TaskAux, TaskStatus};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
    aux: Arc<Mutex<TaskAux>>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        let aux = Arc::new(Mutex::new(task.aux.clone()));
        Self {
            task: Arc::new(task),
            aux,
        }
    }

    pub fn id(&self) -> Uuid {
        self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn current_step(&self) -> usize {
        self.task.current_step
    }

    pub fn retry_count(&self) -> u32 {
        self.task.retry_count
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.task.history
    }

    /// Snapshot of the task as it was leased.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Output of the most recent attempt of `step`; see
    /// [`Task::find_output_by_step`].
    pub fn find_output_by_step(&self, step: impl Into<StepRef>) -> Option<&Value> {
        self.task.find_output_by_step(&step.into())
    }

    /// Current values of the auxiliary slots, including any set by this step.
    pub fn aux(&self) -> TaskAux {
        self.lock_aux().clone()
    }

    pub fn set_score(&self, score: i64) {
        self.lock_aux().score = Some(score);
    }

    pub fn set_output_file(&self, path: impl Into<String>) {
        self.lock_aux().output_file = Some(path.into());
    }

    pub fn set_input_seed(&self, seed: impl Into<String>) {
        self.lock_aux().input_seed = Some(seed.into());
    }

    pub fn set_input_source(&self, source: impl Into<String>) {
        self.lock_aux().input_source = Some(source.into());
    }

    pub fn set_input_source_url(&self, url: impl Into<String>) {
        self.lock_aux().input_source_url = Some(url.into());
    }

    fn lock_aux(&self) -> MutexGuard<'_, TaskAux> {
        // A panicking step cannot leave TaskAux half-written; keep the data.
        self.aux.lock().unwrap_or_else(|e| e.into_inner())
    }
}
