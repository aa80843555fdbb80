//! Durable task model.
//!
//! A `Task` is one resumable instance of a step chain. Its `history` is an
//! append-only audit trail: every execution attempt (success, redirect or
//! failure) leaves exactly one `HistoryEntry`. The JSON shape is camelCase
//! because it is returned verbatim to status-polling callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Task lifecycle states.
///
/// - Pending: waiting to be leased by a worker
/// - Running: leased by exactly one worker
/// - Completed: last step succeeded (terminal)
/// - Failed: a step failed or the retry budget ran out (terminal)
/// - Paused: reserved; nothing in the engine produces it and the lease
///   never selects it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl TaskStatus {
    /// The persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Paused => "PAUSED",
        }
    }

    /// `Completed` and `Failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Paused,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "PAUSED" => Ok(TaskStatus::Paused),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step addressing
// ---------------------------------------------------------------------------

/// Addresses a step either by its position in the registry or by its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Index(usize),
    Name(String),
}

impl From<usize> for StepRef {
    fn from(index: usize) -> Self {
        StepRef::Index(index)
    }
}

impl From<&str> for StepRef {
    fn from(name: &str) -> Self {
        StepRef::Name(name.to_string())
    }
}

impl From<String> for StepRef {
    fn from(name: String) -> Self {
        StepRef::Name(name)
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Index(i) => write!(f, "{i}"),
            StepRef::Name(name) => f.write_str(name),
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One execution attempt of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Index of the step that executed.
    pub step: usize,
    /// Registry name of the step that executed.
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Redirect description ("goto <target> with input: ...").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn success(step: usize, step_key: &str, input: Value, output: Value) -> Self {
        Self {
            step,
            step_key: step_key.to_string(),
            input: Some(input),
            output: Some(output),
            error: None,
            note: None,
            timestamp: Utc::now(),
        }
    }

    pub fn redirect(step: usize, step_key: &str, note: String) -> Self {
        Self {
            step,
            step_key: step_key.to_string(),
            input: None,
            output: None,
            error: None,
            note: Some(note),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(step: usize, step_key: &str, error: &str) -> Self {
        Self {
            step,
            step_key: step_key.to_string(),
            input: None,
            output: None,
            error: Some(error.to_string()),
            note: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether this entry was produced by the step `step` refers to.
    pub fn matches(&self, step: &StepRef) -> bool {
        match step {
            StepRef::Index(i) => self.step == *i,
            StepRef::Name(name) => self.step_key == *name,
        }
    }
}

// ---------------------------------------------------------------------------
// Auxiliary slots
// ---------------------------------------------------------------------------

/// Caller-visible payload slots a step may set.
///
/// The engine persists these verbatim across every transition and assigns
/// them no meaning of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_source_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One durable, resumable instance of a step chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// UUIDv7 assigned at creation; immutable.
    pub id: Uuid,
    pub status: TaskStatus,
    /// Index of the step to execute next.
    pub current_step: usize,
    /// Input handed to the next invocation.
    pub input_for_current_step: Value,
    /// Append-only log of every execution attempt.
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of budgeted redirects taken so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Token of the lease currently holding the task. Set while RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Uuid>,
    #[serde(flatten)]
    pub aux: TaskAux,
}

impl Task {
    /// A fresh task at step 0 with an empty history.
    pub fn new(initial_input: Value, aux: TaskAux) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            status: TaskStatus::Pending,
            current_step: 0,
            input_for_current_step: initial_input,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            retry_count: 0,
            lease_id: None,
            aux,
        }
    }

    /// Output of the most recent history entry for `step`.
    ///
    /// A step visited several times via redirect exposes its latest entry,
    /// not its first. Returns `None` when the step never ran or when its
    /// latest attempt produced no output (redirect or failure).
    pub fn find_output_by_step(&self, step: &StepRef) -> Option<&Value> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.matches(step))
            .and_then(|entry| entry.output.as_ref())
    }

    /// The most recent history entry, if any.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
        }
    }
}
