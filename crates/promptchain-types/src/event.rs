//! Event types for the promptchain event bus.
//!
//! `WorkflowEvent` is broadcast as an execution moves through its lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while executions are launched, advanced and approved.
///
/// Used by the event bus to notify subscribers (CLI progress output, logging,
/// alert sinks) without coupling them to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution has been launched and is running.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_name: String,
        step_count: usize,
    },

    /// An attempt has been durably recorded.
    AttemptRecorded {
        execution_id: Uuid,
        step_id: String,
        attempt_number: u32,
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },

    /// A step passed and the execution moved to the next one.
    StepAdvanced {
        execution_id: Uuid,
        step_id: String,
        next_step_index: usize,
    },

    /// The execution stopped at an approval gate.
    ExecutionPaused {
        execution_id: Uuid,
        workflow_name: String,
        step_id: String,
    },

    /// An operator approved the gate and the execution resumed.
    ExecutionApproved {
        execution_id: Uuid,
        step_id: String,
        note: String,
    },

    /// Every step passed.
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_name: String,
        total_tokens: u64,
        total_cost: f64,
    },

    /// The execution ended in failure.
    ExecutionFailed {
        execution_id: Uuid,
        workflow_name: String,
        reason: String,
    },

    /// The execution was cancelled by an operator.
    ExecutionCancelled { execution_id: Uuid },
}

impl WorkflowEvent {
    /// The execution every variant refers to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::AttemptRecorded { execution_id, .. }
            | WorkflowEvent::StepAdvanced { execution_id, .. }
            | WorkflowEvent::ExecutionPaused { execution_id, .. }
            | WorkflowEvent::ExecutionApproved { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id } => *execution_id,
        }
    }

    /// Whether the event ends the execution or leaves it waiting on an operator.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::ExecutionPaused { .. }
                | WorkflowEvent::ExecutionCompleted { .. }
                | WorkflowEvent::ExecutionFailed { .. }
        )
    }
}
