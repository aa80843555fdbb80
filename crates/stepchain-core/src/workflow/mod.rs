//! Step-chain engine: registry, queue, worker loop, and the facade tying them
//! together for one named workflow.
//!
//! - `registry` -- ordered, named step functions
//! - `outcome` -- `StepOutcome` returned by every step
//! - `handle` -- `TaskHandle`, the view of a task a step receives
//! - `queue` -- `TaskQueue`, creation, lease and state transitions
//! - `worker` -- polling loop that executes steps and records outcomes

pub mod handle;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::repository::task::TaskRepository;
use queue::TaskQueue;
use registry::StepRegistry;
use worker::{Worker, WorkerConfig, WorkerError};

pub use handle::TaskHandle;
pub use outcome::{Redirect, StepOutcome};

/// Options accepted when creating a workflow.
pub type WorkflowOptions = WorkerConfig;

/// One named workflow: a registry of steps over its own task store.
///
/// Several workflows run side by side as independent worker loops over
/// independent stores; they never interact.
pub struct Workflow<R: TaskRepository> {
    name: String,
    queue: TaskQueue<R>,
    registry: Arc<StepRegistry>,
    options: WorkflowOptions,
}

impl<R: TaskRepository + 'static> Workflow<R> {
    pub fn new(
        name: impl Into<String>,
        repo: R,
        registry: StepRegistry,
        options: WorkflowOptions,
    ) -> Self {
        let queue = TaskQueue::new(Arc::new(repo), registry.len());
        Self {
            name: name.into(),
            queue,
            registry: Arc::new(registry),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Caller-facing queue: `start_chain`, `get_task_status`, ...
    pub fn queue(&self) -> &TaskQueue<R> {
        &self.queue
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// A worker over this workflow's queue, for driving the loop by hand.
    pub fn worker(&self) -> Worker<R> {
        Worker::new(
            self.name.clone(),
            self.queue.clone(),
            Arc::clone(&self.registry),
            self.options.clone(),
        )
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn start(&self) -> WorkerHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.worker().run(token.clone()));
        WorkerHandle { token, join }
    }
}

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Token that stops the loop when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for RUNNING tasks to be reset.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.token.cancel();
        self.join
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))
    }
}
