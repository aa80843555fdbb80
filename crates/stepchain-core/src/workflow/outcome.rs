//! What a step returns to the worker loop.

use std::fmt::Display;

use serde_json::Value;
use stepchain_types::task::StepRef;

/// Instruction to execute `target` next with `input`.
#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub target: StepRef,
    pub input: Value,
    /// Budgeted redirects increment the task's `retry_count`.
    pub retryable: bool,
}

/// The three-way result of one step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Output becomes the next step's input.
    Completed(Value),
    /// Jump to another step instead of advancing.
    Redirect(Redirect),
    /// Terminal failure with a message recorded in history.
    Failed(String),
}

impl StepOutcome {
    pub fn completed(output: impl Into<Value>) -> Self {
        StepOutcome::Completed(output.into())
    }

    /// A budgeted redirect: counts against the workflow's `max_retries`.
    pub fn redirect(target: impl Into<StepRef>, input: impl Into<Value>) -> Self {
        StepOutcome::Redirect(Redirect {
            target: target.into(),
            input: input.into(),
            retryable: true,
        })
    }

    /// A redirect that moves `current_step` without consuming the budget.
    pub fn jump(target: impl Into<StepRef>, input: impl Into<Value>) -> Self {
        StepOutcome::Redirect(Redirect {
            target: target.into(),
            input: input.into(),
            retryable: false,
        })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StepOutcome::Failed(message.into())
    }

    /// `Ok` completes, `Err` fails with the error's display text.
    pub fn from_result<E: Display>(result: Result<Value, E>) -> Self {
        match result {
            Ok(output) => StepOutcome::Completed(output),
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            StepOutcome::Completed(_) => "completed",
            StepOutcome::Redirect(_) => "redirect",
            StepOutcome::Failed(_) => "failed",
        }
    }
}

impl<E: Display> From<Result<Value, E>> for StepOutcome {
    fn from(result: Result<Value, E>) -> Self {
        StepOutcome::from_result(result)
    }
}
