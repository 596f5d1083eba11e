//! CLI command definitions for the `pchain` binary.
//!
//! Uses clap derive macros for argument parsing. Definition management lives
//! under `pchain workflow`; execution control is top level (`pchain run`,
//! `pchain approve`).

pub mod execution;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Run chains of LLM prompt steps with completion checks and approval gates.
#[derive(Parser)]
#[command(name = "pchain", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity. `RUST_LOG` overrides it.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,promptchain=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions (register, list, estimate).
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Launch a workflow and drive it until it pauses or finishes.
    Run {
        /// Workflow UUID or name.
        workflow: String,
    },

    /// Show an execution with its attempts and usage.
    Status {
        /// Execution UUID.
        execution_id: Uuid,
    },

    /// Approve the gate a paused execution is waiting on.
    Approve {
        /// Execution UUID.
        execution_id: Uuid,

        /// Note recorded with the approval.
        #[arg(long)]
        note: Option<String>,

        /// Record the approval without running the remaining steps.
        #[arg(long)]
        no_continue: bool,
    },

    /// Cancel a pending, running or paused execution.
    Cancel {
        /// Execution UUID.
        execution_id: Uuid,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workflow_register() {
        let cli = Cli::try_parse_from(["pchain", "workflow", "register", "chain.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Workflow {
                action: workflow::WorkflowCommand::Register { ref file }
            } if file.to_str() == Some("chain.yaml")
        ));
    }

    #[test]
    fn test_parse_approve_flags() {
        let id = Uuid::now_v7();
        let id_str = id.to_string();
        let cli = Cli::try_parse_from([
            "pchain",
            "approve",
            id_str.as_str(),
            "--note",
            "looks good",
            "--no-continue",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Approve {
                execution_id,
                note,
                no_continue,
            } => {
                assert_eq!(execution_id, id);
                assert_eq!(note.as_deref(), Some("looks good"));
                assert!(no_continue);
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_execution_id() {
        assert!(Cli::try_parse_from(["pchain", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["pchain", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { port, host } => {
                assert_eq!(port, 3000);
                assert_eq!(host, "127.0.0.1");
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_log_directive_follows_verbosity() {
        let quiet = Cli::try_parse_from(["pchain", "--quiet", "serve"]).unwrap();
        assert_eq!(quiet.log_directive(), "error");

        let verbose = Cli::try_parse_from(["pchain", "-v", "serve"]).unwrap();
        assert_eq!(verbose.log_directive(), "info,promptchain=debug");

        let trace = Cli::try_parse_from(["pchain", "-vv", "serve"]).unwrap();
        assert_eq!(trace.log_directive(), "trace");
    }
}
