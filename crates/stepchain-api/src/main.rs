//! stepchain admin CLI entry point.
//!
//! Binary name: `stepchain`
//!
//! Parses CLI arguments, sets up tracing, resolves the data directory, then
//! dispatches to the task command handlers. Workers themselves run inside the
//! host application; this binary only inspects and administers their stores.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use stepchain_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use stepchain_types::task::TaskAux;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepchain", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.data_dir.clone()).await?;

    match cli.command {
        Commands::Start {
            workflow,
            input,
            seed,
            source,
            source_url,
        } => {
            let aux = TaskAux {
                input_seed: seed,
                input_source: source,
                input_source_url: source_url,
                ..Default::default()
            };
            cli::task::start_task(&state, &workflow, &input, aux, cli.json, cli.quiet).await?;
        }

        Commands::Status { workflow, task_id } => {
            cli::task::show_task(&state, &workflow, &task_id, cli.json).await?;
        }

        Commands::List {
            workflow,
            status,
            limit,
        } => {
            cli::task::list_tasks(&state, &workflow, status.as_deref(), limit, cli.json).await?;
        }

        Commands::Recover {
            workflow,
            stale_secs,
        } => {
            cli::task::recover_tasks(&state, &workflow, stale_secs, cli.json).await?;
        }

        Commands::Summary { workflow } => {
            cli::task::summarize(&state, &workflow, cli.json).await?;
        }

        Commands::Watch {
            workflow,
            task_id,
            interval_ms,
        } => {
            cli::task::watch_task(&state, &workflow, &task_id, interval_ms, cli.json, cli.quiet)
                .await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed that branch never resolves.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
