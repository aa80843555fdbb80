//! Polling worker loop.
//!
//! One worker runs one task step at a time: lease the oldest PENDING task,
//! run the step at its `current_step`, and report the outcome to the queue.
//! An empty queue is not an error; the worker sleeps for `poll_interval` and
//! tries again. When the shutdown token fires, an in-flight step is
//! abandoned and every RUNNING task is put back to PENDING.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use stepchain_types::task::{Task, TaskAux, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::handle::TaskHandle;
use super::outcome::{Redirect, StepOutcome};
use super::queue::{QueueError, TaskQueue};
use super::registry::StepRegistry;
use crate::repository::task::TaskRepository;

/// Default idle sleep between lease attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2_000);

/// Default cap on redirects per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Config / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Redirects are honored only while `retry_count < max_retries`.
    pub max_retries: u32,
    pub poll_interval: Duration,
    /// Requeue RUNNING tasks whose lease is older than this before each
    /// lease attempt. `None` keeps leases forever.
    pub stale_lease_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_lease_after: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("worker task ended abnormally: {0}")]
    Join(String),
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// No PENDING task was available.
    Idle,
    /// One step ran; the task is now in `status`.
    Processed { task_id: Uuid, status: TaskStatus },
    /// One step ran but its lease was requeued meanwhile; the result was
    /// dropped and the task belongs to whoever holds it now.
    Discarded { task_id: Uuid },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker<R: TaskRepository> {
    workflow: String,
    queue: TaskQueue<R>,
    registry: Arc<StepRegistry>,
    config: WorkerConfig,
}

impl<R: TaskRepository> Worker<R> {
    pub fn new(
        workflow: impl Into<String>,
        queue: TaskQueue<R>,
        registry: Arc<StepRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            queue,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled, then reset RUNNING tasks.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            workflow = %self.workflow,
            steps = self.registry.len(),
            max_retries = self.config.max_retries,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker started"
        );

        loop {
            let idle = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                tick = self.tick() => match tick {
                    Ok(Tick::Idle) => true,
                    Ok(Tick::Processed { .. } | Tick::Discarded { .. }) => false,
                    Err(e) => {
                        tracing::error!(workflow = %self.workflow, error = %e, "worker iteration failed");
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        if let Err(e) = self.queue.recover_running().await {
            tracing::error!(
                workflow = %self.workflow,
                error = %e,
                "failed to reset running tasks on shutdown"
            );
        }
        tracing::info!(workflow = %self.workflow, "worker stopped");
    }

    /// One iteration: optional stale-lease sweep, lease, execute, record.
    pub async fn tick(&self) -> Result<Tick, WorkerError> {
        if let Some(window) = self.config.stale_lease_after {
            self.queue.requeue_stale(window).await?;
        }

        let Some(task) = self.queue.find_and_lock_task().await? else {
            return Ok(Tick::Idle);
        };

        let task_id = task.id;
        match self.process(task).await {
            Ok(updated) => Ok(Tick::Processed {
                task_id,
                status: updated.status,
            }),
            Err(QueueError::LeaseLost { .. }) => {
                tracing::warn!(
                    workflow = %self.workflow,
                    task_id = %task_id,
                    "lease was requeued while the step ran, result discarded"
                );
                Ok(Tick::Discarded { task_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process(&self, task: Task) -> Result<Task, QueueError> {
        let index = task.current_step;
        let Some((step_key, step)) = self.registry.name_at(index).zip(self.registry.get(index))
        else {
            let message = format!(
                "step index {index} is outside the registry ({} steps)",
                self.registry.len()
            );
            tracing::warn!(workflow = %self.workflow, task_id = %task.id, error = %message, "task failed");
            let aux = task.aux.clone();
            return self
                .queue
                .update_task_failure(&task, "unknown", &message, aux)
                .await;
        };

        let handle = TaskHandle::new(task.clone());
        let span = info_span!(
            "step",
            workflow = %self.workflow,
            task_id = %task.id,
            step = step_key,
            index,
            retry_count = task.retry_count
        );

        let invocation = step(task.input_for_current_step.clone(), handle.clone());
        let outcome = AssertUnwindSafe(invocation)
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| StepOutcome::Failed(panic_message(panic.as_ref())));
        let aux = handle.aux();

        tracing::debug!(task_id = %task.id, step = step_key, outcome = outcome.kind(), "step returned");

        match outcome {
            StepOutcome::Completed(output) => {
                let updated = self
                    .queue
                    .update_task_success(&task, step_key, output, aux)
                    .await?;
                if updated.status == TaskStatus::Completed {
                    tracing::info!(workflow = %self.workflow, task_id = %task.id, "task completed");
                }
                Ok(updated)
            }
            StepOutcome::Redirect(redirect) => self.redirect(&task, step_key, redirect, aux).await,
            StepOutcome::Failed(message) => {
                tracing::warn!(
                    workflow = %self.workflow,
                    task_id = %task.id,
                    step = step_key,
                    error = %message,
                    "task failed"
                );
                self.queue
                    .update_task_failure(&task, step_key, &message, aux)
                    .await
            }
        }
    }

    async fn redirect(
        &self,
        task: &Task,
        step_key: &str,
        redirect: Redirect,
        aux: TaskAux,
    ) -> Result<Task, QueueError> {
        let Some(target) = self.registry.resolve(&redirect.target) else {
            let message = format!("redirect target '{}' is not a registered step", redirect.target);
            tracing::warn!(task_id = %task.id, step = step_key, error = %message, "task failed");
            return self
                .queue
                .update_task_failure(task, step_key, &message, aux)
                .await;
        };

        if task.retry_count >= self.config.max_retries {
            let message = format!(
                "retry budget exhausted after {} redirects (goto {})",
                task.retry_count, redirect.target
            );
            tracing::warn!(task_id = %task.id, step = step_key, error = %message, "task failed");
            return self
                .queue
                .update_task_failure(task, step_key, &message, aux)
                .await;
        }

        let retry_count = if redirect.retryable {
            task.retry_count + 1
        } else {
            task.retry_count
        };
        let note = format!("goto {} with input: {}", redirect.target, redirect.input);
        tracing::info!(
            task_id = %task.id,
            from = step_key,
            to = %redirect.target,
            retry_count,
            "redirecting task"
        );

        self.queue
            .update_goto_step(
                task,
                step_key,
                target,
                redirect.input,
                note,
                retry_count,
                aux,
            )
            .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("step panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryTaskRepository;
    use crate::repository::task::TaskRepository;
    use serde_json::{Value, json};
    use stepchain_types::task::StepRef;

    fn append(suffix: &'static str) -> impl Fn(Value, TaskHandle) -> futures_util::future::Ready<StepOutcome> {
        move |input, _| {
            let s = input.as_str().unwrap_or_default();
            futures_util::future::ready(StepOutcome::completed(format!("{s}{suffix}")))
        }
    }

    fn worker(registry: StepRegistry, max_retries: u32) -> Worker<InMemoryTaskRepository> {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskRepository::new()), registry.len());
        let config = WorkerConfig {
            max_retries,
            poll_interval: Duration::from_millis(10),
            stale_lease_after: None,
        };
        Worker::new("test", queue, Arc::new(registry), config)
    }

    async fn drain(w: &Worker<InMemoryTaskRepository>) -> usize {
        let mut ticks = 0;
        while let Tick::Processed { .. } = w.tick().await.unwrap() {
            ticks += 1;
            assert!(ticks < 100, "worker did not settle");
        }
        ticks
    }

    #[tokio::test]
    async fn test_linear_completion() {
        let registry = StepRegistry::builder()
            .step("a", append("A"))
            .step("b", append("B"))
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let id = w.queue.start_chain(json!("S")).await.unwrap();

        let tick = w.tick().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed {
                task_id: id,
                status: TaskStatus::Pending
            }
        );
        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.current_step, 1);
        assert_eq!(task.input_for_current_step, json!("SA"));
        assert_eq!(task.history.len(), 1);

        w.tick().await.unwrap();
        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.history.len(), 2);
        assert_eq!(task.last_entry().unwrap().output, Some(json!("SAB")));

        assert_eq!(w.tick().await.unwrap(), Tick::Idle);
    }

    fn redirect_until_ok() -> StepRegistry {
        StepRegistry::builder()
            .step("a", |x, _| async move { StepOutcome::Completed(x) })
            .step("b", |x, _| async move {
                if x != json!("ok") {
                    return StepOutcome::redirect("a", "ok");
                }
                StepOutcome::completed("done")
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_redirect_within_budget_completes() {
        let w = worker(redirect_until_ok(), 2);
        let id = w.queue.start_chain(json!("bad")).await.unwrap();
        assert_eq!(drain(&w).await, 4);

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_entry().unwrap().output, Some(json!("done")));

        let redirect = &task.history[1];
        assert_eq!(redirect.step_key, "b");
        assert_eq!(redirect.note.as_deref(), Some("goto a with input: \"ok\""));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let registry = StepRegistry::builder()
            .step("a", |x, _| async move { StepOutcome::Completed(x) })
            .step("b", |_, _| async { StepOutcome::redirect("a", "again") })
            .build()
            .unwrap();
        let w = worker(registry, 1);
        let id = w.queue.start_chain(json!("x")).await.unwrap();
        assert_eq!(drain(&w).await, 4);

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.history.len(), 4);
        let last = task.last_entry().unwrap();
        assert_eq!(last.step_key, "b");
        assert!(last.error.as_deref().unwrap().contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_zero_retry_budget_disables_redirects() {
        let registry = StepRegistry::builder()
            .step("a", |x, _| async move {
                if x == json!("skip") {
                    return StepOutcome::jump("b", "skipped");
                }
                StepOutcome::redirect("b", "again")
            })
            .step("b", append("B"))
            .build()
            .unwrap();
        let w = worker(registry, 0);
        let redirected = w.queue.start_chain(json!("x")).await.unwrap();
        let jumped = w.queue.start_chain(json!("skip")).await.unwrap();
        assert_eq!(drain(&w).await, 2);

        for id in [redirected, jumped] {
            let task = w.queue.get_task_status(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.retry_count, 0);
            assert_eq!(task.history.len(), 1);
            let error = task.last_entry().unwrap().error.as_deref().unwrap();
            assert!(error.starts_with("retry budget exhausted after 0 redirects"));
        }
    }

    #[tokio::test]
    async fn test_unbudgeted_jump_keeps_retry_count() {
        let registry = StepRegistry::builder()
            .step("a", |x, _| async move {
                if x == json!("skip") {
                    return StepOutcome::jump("c", "skipped");
                }
                StepOutcome::Completed(x)
            })
            .step("b", append("B"))
            .step("c", append("C"))
            .build()
            .unwrap();
        let w = worker(registry, 1);
        let id = w.queue.start_chain(json!("skip")).await.unwrap();
        assert_eq!(drain(&w).await, 2);

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.last_entry().unwrap().output, Some(json!("skippedC")));
    }

    #[tokio::test]
    async fn test_later_step_sees_most_recent_output() {
        let registry = StepRegistry::builder()
            .step("a", |_, task: TaskHandle| async move {
                if task.find_output_by_step("a").is_none() {
                    StepOutcome::completed("first")
                } else {
                    StepOutcome::completed("second")
                }
            })
            .step("b", |x, task: TaskHandle| async move {
                if task.retry_count() == 0 {
                    return StepOutcome::redirect(0usize, "again");
                }
                StepOutcome::Completed(x)
            })
            .step("c", |_, task: TaskHandle| async move {
                let seen = task.find_output_by_step("a").cloned().unwrap_or_default();
                StepOutcome::Completed(seen)
            })
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let id = w.queue.start_chain(json!(null)).await.unwrap();
        drain(&w).await;

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.last_entry().unwrap().output, Some(json!("second")));
        assert_eq!(
            task.find_output_by_step(&StepRef::from("a")),
            Some(&json!("second"))
        );
    }

    #[tokio::test]
    async fn test_failure_is_terminal() {
        let registry = StepRegistry::builder()
            .step("a", |_, _| async { StepOutcome::failed("upstream 500") })
            .step("b", append("B"))
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let id = w.queue.start_chain(json!("x")).await.unwrap();
        drain(&w).await;

        for _ in 0..3 {
            assert_eq!(w.tick().await.unwrap(), Tick::Idle);
            let task = w.queue.get_task_status(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.history.len(), 1);
            assert_eq!(task.history[0].error.as_deref(), Some("upstream 500"));
        }
    }

    #[tokio::test]
    async fn test_unknown_redirect_target_fails() {
        let registry = StepRegistry::builder()
            .step("a", |_, _| async { StepOutcome::redirect("publish", json!({})) })
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let id = w.queue.start_chain(json!("x")).await.unwrap();
        drain(&w).await;

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.history[0].error.as_deref().unwrap().contains("publish"));
    }

    #[tokio::test]
    async fn test_out_of_range_step_fails() {
        let registry = StepRegistry::builder()
            .step("a", append("A"))
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let mut task = Task::new(json!("x"), TaskAux::default());
        task.current_step = 5;
        w.queue.repo().insert_task(&task).await.unwrap();

        drain(&w).await;
        let stored = w.queue.get_task_status(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.history[0].error.as_deref().unwrap().contains("outside the registry"));
    }

    #[tokio::test]
    async fn test_panicking_step_fails_task() {
        let registry = StepRegistry::builder()
            .step("a", |x: Value, _| async move {
                if x == json!("x") {
                    panic!("model exploded");
                }
                StepOutcome::Completed(x)
            })
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let id = w.queue.start_chain(json!("x")).await.unwrap();
        drain(&w).await;

        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.history[0].error.as_deref(),
            Some("step panicked: model exploded")
        );
    }

    #[tokio::test]
    async fn test_aux_slots_survive_transitions() {
        let registry = StepRegistry::builder()
            .step("render", |x, task: TaskHandle| async move {
                task.set_output_file("/out/scene.mp4");
                StepOutcome::Completed(x)
            })
            .step("score", |x, task: TaskHandle| async move {
                if task.retry_count() == 0 {
                    task.set_score(4);
                    return StepOutcome::redirect("render", x);
                }
                task.set_score(8);
                StepOutcome::Completed(x)
            })
            .step("check", |x, task: TaskHandle| async move {
                if task.aux().score != Some(8) {
                    return StepOutcome::failed("score missing");
                }
                StepOutcome::Completed(x)
            })
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let aux = TaskAux {
            input_seed: Some("seed-42".to_string()),
            ..Default::default()
        };
        let id = w.queue.start_chain_with(json!("p"), aux).await.unwrap();

        // render, score(redirect)
        w.tick().await.unwrap();
        w.tick().await.unwrap();
        let mid = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(mid.aux.score, Some(4));
        assert_eq!(mid.aux.output_file.as_deref(), Some("/out/scene.mp4"));

        drain(&w).await;
        let task = w.queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.aux.score, Some(8));
        assert_eq!(task.aux.input_seed.as_deref(), Some("seed-42"));
        assert_eq!(task.aux.output_file.as_deref(), Some("/out/scene.mp4"));
    }

    #[tokio::test]
    async fn test_abandoned_lease_stays_running_without_expiry() {
        let registry = StepRegistry::builder()
            .step("a", append("A"))
            .build()
            .unwrap();
        let mut w = worker(registry, 3);
        let id = w.queue.start_chain(json!("x")).await.unwrap();

        // A worker that leased the task and vanished.
        w.queue.find_and_lock_task().await.unwrap().unwrap();
        assert_eq!(w.tick().await.unwrap(), Tick::Idle);
        assert_eq!(
            w.queue.get_task_status(id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        w.config.stale_lease_after = Some(Duration::from_millis(10));
        assert_eq!(
            w.tick().await.unwrap(),
            Tick::Processed {
                task_id: id,
                status: TaskStatus::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_result_of_requeued_lease_is_discarded() {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskRepository::new()), 1);
        let rival = queue.clone();
        let registry = StepRegistry::builder()
            .step("a", move |x, _| {
                let rival = rival.clone();
                async move {
                    // Another worker's shutdown resets the lease, then it is leased again.
                    rival.recover_running().await.unwrap();
                    rival.find_and_lock_task().await.unwrap().unwrap();
                    StepOutcome::Completed(x)
                }
            })
            .build()
            .unwrap();
        let w = Worker::new("test", queue.clone(), Arc::new(registry), WorkerConfig::default());
        let id = queue.start_chain(json!("x")).await.unwrap();

        assert_eq!(w.tick().await.unwrap(), Tick::Discarded { task_id: id });
        let task = queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.history.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_resets_in_flight_task() {
        let registry = StepRegistry::builder()
            .step("slow", |x, _| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                StepOutcome::Completed(x)
            })
            .build()
            .unwrap();
        let w = worker(registry, 3);
        let queue = w.queue.clone();
        let id = queue.start_chain(json!("x")).await.unwrap();

        let token = CancellationToken::new();
        let join = tokio::spawn(w.run(token.clone()));

        let mut running = false;
        for _ in 0..200 {
            let status = queue.get_task_status(id).await.unwrap().unwrap().status;
            if status == TaskStatus::Running {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(running, "task was never leased");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();

        let task = queue.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.history.is_empty());
    }

    #[tokio::test]
    async fn test_idle_worker_stops_promptly() {
        let registry = StepRegistry::builder()
            .step("a", append("A"))
            .build()
            .unwrap();
        let mut w = worker(registry, 3);
        w.config.poll_interval = Duration::from_secs(3600);

        let token = CancellationToken::new();
        let join = tokio::spawn(w.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "step panicked: static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "step panicked: owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert!(panic_message(other.as_ref()).contains("unknown"));
    }
}
