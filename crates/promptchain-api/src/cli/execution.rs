//! CLI execution subcommands: run, status, approve and cancel.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use promptchain_core::workflow::cost::format_cost;
use promptchain_types::event::WorkflowEvent;
use promptchain_types::workflow::{Execution, ExecutionStatus, ExecutionView};

use crate::cli::workflow::resolve_workflow;
use crate::state::AppState;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Styled,
    Json,
    Quiet,
}

impl OutputMode {
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            OutputMode::Json
        } else if quiet {
            OutputMode::Quiet
        } else {
            OutputMode::Styled
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Launch a workflow and drive it in the foreground until it pauses or finishes.
pub async fn handle_run(target: &str, state: &AppState, mode: OutputMode) -> Result<()> {
    let def = resolve_workflow(target, state).await?;
    let execution_id = state.engine.launch(def.id).await?;

    if mode == OutputMode::Styled {
        println!();
        println!(
            "  {} Launched '{}' ({} steps)",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.steps.len()
        );
        println!("  Execution: {execution_id}");
        println!();
    }

    drive(execution_id, state, mode).await
}

/// Advance an execution with live progress, then print its final view.
async fn drive(execution_id: Uuid, state: &AppState, mode: OutputMode) -> Result<()> {
    let progress = (mode == OutputMode::Styled).then(|| {
        let mut rx = state.engine.event_bus().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.execution_id() == execution_id => print_progress(&event),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let outcome = state.engine.advance(execution_id).await;
    if let Some(handle) = progress {
        handle.abort();
    }
    outcome?;

    let view = state.engine.get_execution(execution_id).await?;
    print_view(&view, mode)
}

fn print_progress(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::AttemptRecorded {
            step_id,
            attempt_number,
            passed: true,
            ..
        } => println!(
            "  {} {step_id} (attempt {attempt_number}) passed",
            style("+").green().bold()
        ),
        WorkflowEvent::AttemptRecorded {
            step_id,
            attempt_number,
            failure_reason,
            ..
        } => println!(
            "  {} {step_id} (attempt {attempt_number}) failed: {}",
            style("x").red().bold(),
            failure_reason.as_deref().unwrap_or("unknown")
        ),
        WorkflowEvent::ExecutionPaused { step_id, .. } => println!(
            "  {} Waiting for approval after '{step_id}'",
            style("||").yellow().bold()
        ),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Show an execution with its attempt history and usage totals.
pub async fn handle_status(execution_id: Uuid, state: &AppState, mode: OutputMode) -> Result<()> {
    let view = state.engine.get_execution(execution_id).await?;
    print_view(&view, mode)
}

fn print_view(view: &ExecutionView, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(view)?);
            return Ok(());
        }
        OutputMode::Quiet => {
            println!("{}", view.execution.status);
            return Ok(());
        }
        OutputMode::Styled => {}
    }

    let execution = &view.execution;
    println!();
    println!(
        "  Execution {} of '{}'",
        style(execution.id).bold(),
        style(&execution.workflow_name).cyan()
    );
    println!("  Status: {}", styled_status(execution.status));
    println!(
        "  Step: {}/{}",
        execution.current_step_index.min(execution.snapshot.len()),
        execution.snapshot.len()
    );
    if let Some(ref reason) = execution.failure_reason {
        println!("  Failure: {}", style(reason).red());
    }

    if !execution.attempts.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("#"),
                Cell::new("Model"),
                Cell::new("Result"),
                Cell::new("Tokens"),
                Cell::new("Reason"),
            ]);

        for attempt in &execution.attempts {
            let result = if attempt.criteria_passed {
                Cell::new("passed").fg(Color::Green)
            } else {
                Cell::new("failed").fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(&attempt.step_id),
                Cell::new(attempt.attempt_number),
                Cell::new(&attempt.model),
                result,
                Cell::new(attempt.tokens_used.map(|t| t.to_string()).unwrap_or_default()),
                Cell::new(attempt.failure_reason.as_deref().unwrap_or("")),
            ]);
        }

        println!();
        println!("{table}");
    }

    println!(
        "  Usage: {} attempts, {} tokens, {}",
        view.usage.attempts,
        view.usage.total_tokens,
        format_cost(view.usage.total_cost)
    );
    if let Some(ref narrative) = execution.narrative {
        println!();
        for line in narrative.lines() {
            println!("  {}", style(line).dim());
        }
    }
    if execution.status == ExecutionStatus::Paused {
        println!();
        println!(
            "  Approve with: {}",
            style(format!("pchain approve {}", execution.id)).dim()
        );
    }
    println!();

    Ok(())
}

fn styled_status(status: ExecutionStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => style(text).green().bold(),
        ExecutionStatus::Failed => style(text).red().bold(),
        ExecutionStatus::Paused => style(text).yellow().bold(),
        ExecutionStatus::Cancelled => style(text).dim(),
        ExecutionStatus::Pending | ExecutionStatus::Running => style(text).cyan(),
    }
}

// ---------------------------------------------------------------------------
// Approve / Cancel
// ---------------------------------------------------------------------------

/// Approve the gate a paused execution waits on, then keep driving it unless
/// `no_continue` is set.
pub async fn handle_approve(
    execution_id: Uuid,
    note: Option<String>,
    no_continue: bool,
    state: &AppState,
    mode: OutputMode,
) -> Result<()> {
    let execution = state.engine.approve(execution_id, note).await?;

    if mode == OutputMode::Styled {
        println!();
        println!(
            "  {} Approved execution {}",
            style("*").green().bold(),
            execution.id
        );
    }

    if execution.status == ExecutionStatus::Running && !no_continue {
        return drive(execution_id, state, mode).await;
    }
    print_execution(&execution, mode)
}

/// Cancel a pending, running or paused execution.
pub async fn handle_cancel(execution_id: Uuid, state: &AppState, mode: OutputMode) -> Result<()> {
    let execution = state.engine.cancel(execution_id).await?;

    if mode == OutputMode::Styled {
        println!();
        println!(
            "  {} Cancelled execution {}",
            style("*").green().bold(),
            execution.id
        );
    }
    print_execution(&execution, mode)
}

fn print_execution(execution: &Execution, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(execution)?),
        OutputMode::Quiet => println!("{}", execution.status),
        OutputMode::Styled => {
            println!("  Status: {}", styled_status(execution.status));
            println!();
        }
    }
    Ok(())
}
