//! CLI workflow definition subcommands.
//!
//! Provides register, list and estimate operations for workflow definitions.

use std::path::Path;

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use promptchain_core::repository::workflow::WorkflowRepository;
use promptchain_core::workflow::cost::format_cost;
use promptchain_core::workflow::{WorkflowError, load_workflow_file};
use promptchain_types::workflow::WorkflowDefinition;

use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register (or update) a workflow from a YAML file.
    Register {
        /// Path to the workflow YAML file.
        file: std::path::PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Estimate the cost of one clean pass through a workflow.
    Estimate {
        /// Workflow UUID or name.
        workflow: String,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Register { file } => handle_register(&file, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Estimate { workflow } => handle_estimate(&workflow, state, json).await,
    }
}

/// Resolve a workflow argument given as a UUID or a registered name.
pub async fn resolve_workflow(target: &str, state: &AppState) -> Result<WorkflowDefinition> {
    let repo = state.engine.repo();
    if let Ok(id) = target.parse::<Uuid>()
        && let Some(def) = repo
            .get_definition(&id)
            .await
            .map_err(|e| anyhow!("Failed to look up workflow: {e}"))?
    {
        return Ok(def);
    }

    repo.list_definitions()
        .await
        .map_err(|e| anyhow!("Failed to list workflows: {e}"))?
        .into_iter()
        .find(|d| d.name == target)
        .ok_or_else(|| anyhow!("No workflow found for '{target}'. Try a UUID or workflow name."))
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

async fn handle_register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let mut def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow!("Workflow validation failed: {msg}"),
        other => anyhow!("Failed to load workflow: {other}"),
    })?;

    // Re-registering a name keeps its id so existing executions stay attached.
    if let Ok(existing) = resolve_workflow(&def.name, state).await {
        def.id = existing.id;
    }

    let def = state.engine.register_definition(def).await?;
    let estimate = state.engine.estimate(def.id).await?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "steps": def.steps.len(),
            "estimated_cost": estimate,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Registered workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Steps: {}", def.steps.len());
        println!("  Estimated cost: {}", format_cost(estimate));
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .engine
        .repo()
        .list_definitions()
        .await
        .map_err(|e| anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "steps": d.steps.len(),
                    "gates": d.steps.iter().filter(|s| s.requires_approval).count(),
                    "updated_at": d.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("pchain workflow register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Steps"),
            Cell::new("Gates"),
            Cell::new("Updated"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.id),
            Cell::new(d.steps.len()),
            Cell::new(d.steps.iter().filter(|s| s.requires_approval).count()),
            Cell::new(d.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Estimate
// ---------------------------------------------------------------------------

async fn handle_estimate(target: &str, state: &AppState, json: bool) -> Result<()> {
    let def = resolve_workflow(target, state).await?;
    let total = state.engine.estimate(def.id).await?;
    let accountant = state.engine.accountant();

    if json {
        let out = serde_json::json!({
            "workflow_id": def.id.to_string(),
            "name": def.name,
            "estimated_cost": total,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Model"),
            Cell::new("Price / 1k"),
            Cell::new("Max attempts"),
        ]);

    for step in def.ordered_steps() {
        let model = state.engine.resolve_model(&step);
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(&model),
            Cell::new(format!("${:.4}", accountant.price_per_1k(&model))),
            Cell::new(step.max_attempts()),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  Estimated cost for '{}': {}",
        style(&def.name).cyan(),
        style(format_cost(total)).bold()
    );
    println!();

    Ok(())
}
