//! CLI task subcommands: start, status, list, recover, summary, watch.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use stepchain_core::repository::task::TaskRepository;
use stepchain_types::task::{HistoryEntry, Task, TaskAux, TaskFilter, TaskStatus};

use crate::state::AppState;

/// Columns of free text (inputs, outputs, errors) are cut to this many chars.
const DETAIL_WIDTH: usize = 60;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn start_task(
    state: &AppState,
    workflow: &str,
    input: &str,
    aux: TaskAux,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let repo = state.open_repo(workflow).await?;
    let task = Task::new(parse_input(input), aux);
    repo.insert_task(&task)
        .await
        .map_err(|e| anyhow!("Failed to enqueue task: {e}"))?;
    tracing::info!(workflow, task_id = %task.id, "task enqueued");

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else if quiet {
        println!("{}", task.id);
    } else {
        println!();
        println!(
            "  {} Enqueued task in '{}'",
            style("*").green().bold(),
            style(workflow).cyan()
        );
        println!("  ID: {}", task.id);
        println!("  Input: {}", truncate(&task.input_for_current_step.to_string(), DETAIL_WIDTH));
        println!();
    }

    Ok(())
}

/// JSON if it parses, otherwise the raw text as a JSON string.
pub fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn show_task(state: &AppState, workflow: &str, task_id: &str, json: bool) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let repo = state.open_repo(workflow).await?;
    let task = repo
        .get_task(&id)
        .await
        .map_err(|e| anyhow!("Failed to get task: {e}"))?
        .ok_or_else(|| anyhow!("Task {id} not found in workflow '{workflow}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    display_task(&task);
    Ok(())
}

fn display_task(task: &Task) {
    println!();
    println!(
        "  {} Task {}",
        style("Task:").bold(),
        style(task.id.to_string()).cyan()
    );
    println!("  Status: {}", style_status(task.status));
    println!("  Current step: {}", task.current_step);
    println!("  Retries: {}", task.retry_count);
    if let Some(lease) = task.lease_id {
        println!("  Lease: {}", style(lease).dim());
    }
    println!("  Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", task.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Input: {}",
        truncate(&task.input_for_current_step.to_string(), DETAIL_WIDTH)
    );
    for (label, value) in aux_fields(&task.aux) {
        println!("  {label}: {value}");
    }

    if task.history.is_empty() {
        println!();
        println!("  No steps executed yet.");
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Result"),
            Cell::new("Detail"),
            Cell::new("At"),
        ]);

    for (i, entry) in task.history.iter().enumerate() {
        let (result, detail) = describe_entry(entry);
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(format!("{} ({})", entry.step_key, entry.step)),
            result,
            Cell::new(truncate(&detail, DETAIL_WIDTH)),
            Cell::new(entry.timestamp.format("%H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

fn describe_entry(entry: &HistoryEntry) -> (Cell, String) {
    if let Some(error) = &entry.error {
        return (Cell::new("failed").fg(Color::Red), error.clone());
    }
    if let Some(note) = &entry.note {
        return (Cell::new("redirect").fg(Color::Magenta), note.clone());
    }
    let output = entry
        .output
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    (Cell::new("ok").fg(Color::Green), output)
}

fn aux_fields(aux: &TaskAux) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(score) = aux.score {
        fields.push(("Score", score.to_string()));
    }
    if let Some(file) = &aux.output_file {
        fields.push(("Output file", file.clone()));
    }
    if let Some(seed) = &aux.input_seed {
        fields.push(("Input seed", seed.clone()));
    }
    if let Some(source) = &aux.input_source {
        fields.push(("Input source", source.clone()));
    }
    if let Some(url) = &aux.input_source_url {
        fields.push(("Input source URL", url.clone()));
    }
    fields
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list_tasks(
    state: &AppState,
    workflow: &str,
    status: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<TaskStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let repo = state.open_repo(workflow).await?;
    let tasks = repo
        .list_tasks(&TaskFilter { status, limit })
        .await
        .map_err(|e| anyhow!("Failed to list tasks: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  No tasks in workflow '{workflow}'.");
        println!(
            "  Enqueue one with: {}",
            style(format!("stepchain start {workflow} --input <json>")).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Retries"),
            Cell::new("Attempts"),
            Cell::new("Created"),
            Cell::new("Updated"),
        ]);

    for t in &tasks {
        table.add_row(vec![
            Cell::new(t.id.to_string()),
            format_status(t.status),
            Cell::new(t.current_step),
            Cell::new(t.retry_count),
            Cell::new(t.history.len()),
            Cell::new(t.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(t.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("  Tasks in workflow '{}'", style(workflow).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn recover_tasks(
    state: &AppState,
    workflow: &str,
    stale_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let repo = state.open_repo(workflow).await?;
    let count = match stale_secs {
        Some(secs) => {
            let age = i64::try_from(secs)
                .ok()
                .and_then(chrono::TimeDelta::try_seconds)
                .unwrap_or(chrono::TimeDelta::MAX);
            let cutoff = Utc::now()
                .checked_sub_signed(age)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            repo.requeue_stale(cutoff).await
        }
        None => repo.reset_running().await,
    }
    .map_err(|e| anyhow!("Failed to recover tasks: {e}"))?;
    tracing::info!(workflow, count, "recovered running tasks");

    if json {
        let out = serde_json::json!({ "workflow": workflow, "recovered": count });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Reset {} running task(s) to pending in '{}'",
        style("*").green().bold(),
        count,
        style(workflow).cyan()
    );
    if stale_secs.is_none() && count > 0 {
        println!(
            "  {}",
            style("Only do this while no worker is running for this workflow.").yellow()
        );
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

pub async fn summarize(state: &AppState, workflow: &str, json: bool) -> Result<()> {
    let repo = state.open_repo(workflow).await?;
    let counts = repo
        .count_by_status()
        .await
        .map_err(|e| anyhow!("Failed to count tasks: {e}"))?;
    let rows = all_statuses(&counts);
    let total: u64 = rows.iter().map(|(_, n)| n).sum();

    if json {
        let mut out = serde_json::Map::new();
        for (status, n) in &rows {
            out.insert(status.as_str().to_lowercase(), Value::from(*n));
        }
        out.insert("total".to_string(), Value::from(total));
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let worker = state.worker_config(workflow);
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_header(vec![Cell::new("Status").fg(Color::Cyan), Cell::new("Tasks")]);
    for (status, n) in &rows {
        table.add_row(vec![format_status(*status), Cell::new(n)]);
    }
    table.add_row(vec![Cell::new("total"), Cell::new(total)]);

    println!();
    println!("  Workflow '{}'", style(workflow).cyan());
    println!(
        "  Database: {}",
        style(
            stepchain_infra::sqlite::pool::workflow_db_path(&state.data_dir, workflow).display()
        )
        .dim()
    );
    println!(
        "  Worker: max_retries={}, poll={}ms, stale_lease={}",
        worker.max_retries,
        worker.poll_interval.as_millis(),
        worker
            .stale_lease_after
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "off".to_string())
    );
    println!();
    println!("{table}");
    println!();

    Ok(())
}

/// Every status in display order, zero-filled.
fn all_statuses(counts: &[(TaskStatus, u64)]) -> Vec<(TaskStatus, u64)> {
    TaskStatus::ALL
        .into_iter()
        .map(|status| {
            let n = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            (status, n)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

pub async fn watch_task(
    state: &AppState,
    workflow: &str,
    task_id: &str,
    interval_ms: Option<u64>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let repo = state.open_repo(workflow).await?;
    let interval = interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.worker_config(workflow).poll_interval);

    let shutdown = crate::shutdown_signal();
    tokio::pin!(shutdown);

    let mut seen: Option<(TaskStatus, usize)> = None;
    let task = loop {
        let task = repo
            .get_task(&id)
            .await
            .map_err(|e| anyhow!("Failed to get task: {e}"))?
            .ok_or_else(|| anyhow!("Task {id} not found in workflow '{workflow}'"))?;

        let progress = (task.status, task.history.len());
        if seen != Some(progress) && !json && !quiet {
            let latest = task
                .last_entry()
                .map(|e| format!(" after '{}'", e.step_key))
                .unwrap_or_default();
            println!(
                "  {} {}{} (step {}, {} attempt(s))",
                style(Utc::now().format("%H:%M:%S")).dim(),
                style_status(task.status),
                latest,
                task.current_step,
                task.history.len()
            );
        }
        seen = Some(progress);

        if task.status.is_terminal() {
            break task;
        }

        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("watch interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else if !quiet {
        display_task(&task);
    }

    if task.status == TaskStatus::Failed {
        let reason = task
            .last_entry()
            .and_then(|e| e.error.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(anyhow!("Task {id} failed: {reason}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_task_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid task ID: '{raw}'"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

fn format_status(status: TaskStatus) -> Cell {
    let label = status.as_str().to_lowercase();
    match status {
        TaskStatus::Pending => Cell::new(label).fg(Color::Yellow),
        TaskStatus::Running => Cell::new(label).fg(Color::Blue),
        TaskStatus::Completed => Cell::new(label).fg(Color::Green),
        TaskStatus::Failed => Cell::new(label).fg(Color::Red),
        TaskStatus::Paused => Cell::new(label).fg(Color::Magenta),
    }
}

fn style_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        TaskStatus::Pending => style(label).yellow(),
        TaskStatus::Running => style(label).blue(),
        TaskStatus::Completed => style(label).green(),
        TaskStatus::Failed => style(label).red(),
        TaskStatus::Paused => style(label).magenta(),
    }
}
