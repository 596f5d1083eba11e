//! Pipeline engine: definitions, step execution and durable run state.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `criteria` -- completion criterion evaluation
//! - `cost` -- token pricing, usage roll-ups and pre-run estimates
//! - `context` -- context forwarded from one step to the next
//! - `checkpoint` -- persistence of attempts and execution records
//! - `lease` -- in-process per-execution exclusion
//! - `step_runner` -- the retry loop for a single step
//! - `controller` -- the execution state machine and public operations

pub mod checkpoint;
pub mod context;
pub mod controller;
pub mod cost;
pub mod criteria;
pub mod definition;
pub mod lease;
pub mod step_runner;

pub use controller::{DEFAULT_APPROVAL_NOTE, EngineError, ExecutionController};
pub use definition::{WorkflowError, load_workflow_file, parse_workflow_yaml, validate_definition};
