//! CLI command definitions for the `stepchain` binary.
//!
//! Uses clap derive macros for argument parsing. Every task command names
//! the workflow whose database it operates on (e.g. `stepchain list scene`).

pub mod task;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Inspect and administer durable step-chain workflows.
#[derive(Parser)]
#[command(name = "stepchain", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $STEPCHAIN_DATA_DIR or ~/.stepchain).
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a new task at the first step of a workflow.
    Start {
        /// Workflow name.
        workflow: String,

        /// Initial input as JSON. Text that is not valid JSON is taken as a string.
        #[arg(long, default_value = "null")]
        input: String,

        /// Value for the task's `inputSeed` slot.
        #[arg(long)]
        seed: Option<String>,

        /// Value for the task's `inputSource` slot.
        #[arg(long)]
        source: Option<String>,

        /// Value for the task's `inputSourceUrl` slot.
        #[arg(long)]
        source_url: Option<String>,
    },

    /// Show one task with its full history.
    Status {
        /// Workflow name.
        workflow: String,

        /// Task UUID.
        task_id: String,
    },

    /// List tasks, newest first.
    #[command(alias = "ls")]
    List {
        /// Workflow name.
        workflow: String,

        /// Only tasks in this status (pending, running, completed, failed, paused).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of tasks to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Put RUNNING tasks back to PENDING.
    Recover {
        /// Workflow name.
        workflow: String,

        /// Only tasks leased more than this many seconds ago.
        #[arg(long)]
        stale_secs: Option<u64>,
    },

    /// Task counts per status.
    Summary {
        /// Workflow name.
        workflow: String,
    },

    /// Poll a task until it completes or fails.
    Watch {
        /// Workflow name.
        workflow: String,

        /// Task UUID.
        task_id: String,

        /// Poll interval in milliseconds (defaults to the workflow's poll interval).
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
