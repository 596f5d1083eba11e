//! promptchain CLI and REST API entry point.
//!
//! Binary name: `pchain`
//!
//! Parses CLI arguments, initializes the database and execution controller,
//! then dispatches to the appropriate command handler or starts the REST API
//! server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokio::sync::broadcast::error::RecvError;

use cli::execution::OutputMode;
use cli::{Cli, Commands};
use promptchain_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_directive(), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pchain", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let mode = OutputMode::from_flags(cli.json, cli.quiet);

    let result = match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Run { workflow } => cli::execution::handle_run(&workflow, &state, mode).await,
        Commands::Status { execution_id } => {
            cli::execution::handle_status(execution_id, &state, mode).await
        }
        Commands::Approve {
            execution_id,
            note,
            no_continue,
        } => cli::execution::handle_approve(execution_id, note, no_continue, &state, mode).await,
        Commands::Cancel { execution_id } => {
            cli::execution::handle_cancel(execution_id, &state, mode).await
        }
        Commands::Serve { port, host } => serve(state, &host, port).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}

/// Run the REST API until Ctrl+C or SIGTERM.
///
/// Executions a previous process left running are re-driven first.
async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let interrupted = state.engine.resume_interrupted().await?;
    for execution_id in &interrupted {
        tracing::info!(execution_id = %execution_id, "resuming interrupted execution");
        state.spawn_advance(*execution_id);
    }

    // Alerts (pauses and terminal outcomes) go to the log.
    let mut events = state.engine.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.is_alert() => tracing::info!(
                    execution_id = %event.execution_id(),
                    event = ?event,
                    "execution alert"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} promptchain API listening on {}",
        console::style("*").green().bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!(
        "  Provider: {}  Data: {}",
        state.config.provider.base_url,
        state.data_dir.display()
    );
    if !interrupted.is_empty() {
        println!("  Resumed {} interrupted execution(s)", interrupted.len());
    }
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
///
/// If a handler cannot be installed the other one still applies.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
