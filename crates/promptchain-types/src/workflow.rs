//! Workflow domain types for promptchain.
//!
//! A workflow is a linear chain of LLM prompt steps. Each step declares a
//! completion criterion its response must satisfy, a retry budget, how much of
//! its output flows into the next step, and whether a human must sign off
//! before the chain continues.
//!
//! Executions carry a frozen copy of the step list taken at launch so later
//! edits to the definition never rewrite history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Model identifier that resolves at run time based on the step's criterion.
pub const AUTO_MODEL: &str = "auto";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, ordered chain of prompt steps.
///
/// Becomes immutable as soon as one execution references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 workflow ID.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable name, 1 to 255 characters.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order. Execution order follows `order_index`.
    pub steps: Vec<StepDefinition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Steps sorted by `order_index`, deep-copied for use as an execution snapshot.
    ///
    /// The sort is stable, so steps sharing an index keep declaration order.
    pub fn ordered_steps(&self) -> Vec<StepDefinition> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.order_index);
        steps
    }
}

/// A single prompt step within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Position in the chain. Gaps are allowed; evaluated ascending.
    pub order_index: i64,
    /// Model identifier, or `"auto"` to pick one from the criterion type.
    pub model: String,
    /// Prompt template sent to the model.
    pub prompt: String,
    /// Rule the response must satisfy.
    pub criterion: CompletionCriterion,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default)]
    pub requires_approval: bool,
}

impl StepDefinition {
    /// Total attempts this step may consume: one initial plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.criterion.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// Completion criteria
// ---------------------------------------------------------------------------

/// Rule a step's response must satisfy, plus the retry budget shared by all kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCriterion {
    #[serde(flatten)]
    pub check: CriterionCheck,
    /// Additional attempts allowed after the first one fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl CompletionCriterion {
    /// Criterion with the default retry budget.
    pub fn new(check: CriterionCheck) -> Self {
        Self {
            check,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// The closed set of response checks. Each variant carries only its own configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionCheck {
    /// Response contains `value` verbatim (case-sensitive).
    ContainsString { value: String },
    /// `pattern` matches anywhere in the response.
    Regex { pattern: String },
    /// Response contains a fenced code block, optionally tagged with `language`.
    HasCodeBlock {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    /// Trimmed response is well-formed JSON.
    ValidJson,
}

impl CriterionCheck {
    /// Short tag used in logs and tables.
    pub fn kind(&self) -> &'static str {
        match self {
            CriterionCheck::ContainsString { .. } => "contains_string",
            CriterionCheck::Regex { .. } => "regex",
            CriterionCheck::HasCodeBlock { .. } => "has_code_block",
            CriterionCheck::ValidJson => "valid_json",
        }
    }

    /// Whether the check expects machine-readable output.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            CriterionCheck::Regex { .. } | CriterionCheck::ValidJson
        )
    }
}

/// How much of the previous step's output is forwarded to the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// The whole response text.
    #[default]
    Full,
    /// The leading characters of the response, with a truncation marker.
    TruncateChars,
}

/// Classification attached to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The response did not satisfy the criterion.
    CriteriaFailed,
    /// The criterion itself is malformed (e.g. an invalid regex).
    InvalidConfig,
    /// The response could not be parsed (valid_json).
    ParseError,
    /// The provider call failed without a usable response.
    ProviderError,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::CriteriaFailed => write!(f, "criteria_failed"),
            FailureType::InvalidConfig => write!(f, "invalid_config"),
            FailureType::ParseError => write!(f, "parse_error"),
            FailureType::ProviderError => write!(f, "provider_error"),
        }
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "criteria_failed" => Ok(FailureType::CriteriaFailed),
            "invalid_config" => Ok(FailureType::InvalidConfig),
            "parse_error" => Ok(FailureType::ParseError),
            "provider_error" => Ok(FailureType::ProviderError),
            other => Err(format!("invalid failure type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, failed and cancelled executions accept no further operations.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether a polling client should keep re-fetching.
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution (run instance)
// ---------------------------------------------------------------------------

/// A single run of a workflow against a frozen copy of its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Name of the workflow (denormalized for display).
    pub workflow_name: String,
    /// Steps as they were at launch, sorted by `order_index`.
    pub snapshot: Vec<StepDefinition>,
    pub status: ExecutionStatus,
    /// Index into `snapshot` of the step being (or about to be) run.
    pub current_step_index: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable cause when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Free-text summary of how the run went.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    /// Operator sign-offs, one per approved gate.
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    /// Attempt history in the order it was recorded.
    #[serde(default)]
    pub attempts: Vec<StepAttempt>,
}

impl Execution {
    /// A fresh pending execution over `snapshot`.
    pub fn new(workflow: &WorkflowDefinition, snapshot: Vec<StepDefinition>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            snapshot,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            narrative: None,
            approvals: Vec::new(),
            attempts: Vec::new(),
        }
    }

    /// The step at `current_step_index`, if the chain has not run past its end.
    pub fn current_step(&self) -> Option<&StepDefinition> {
        self.snapshot.get(self.current_step_index)
    }

    /// Attempts recorded for one step, in order.
    pub fn attempts_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepAttempt> {
        self.attempts.iter().filter(move |a| a.step_id == step_id)
    }
}

/// An operator's sign-off on an approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub step_id: String,
    pub note: String,
    pub approved_at: DateTime<Utc>,
}

/// One provider call for a step, paired with its criterion verdict.
///
/// Written once and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    /// 1-based, strictly increasing per step.
    pub attempt_number: u32,
    /// Model actually invoked (after `auto` resolution).
    pub model: String,
    /// Prompt after context composition.
    pub prompt_sent: String,
    /// Response text; absent when the provider call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub criteria_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Usage and projection
// ---------------------------------------------------------------------------

/// Token and cost totals for one step of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUsage {
    pub step_id: String,
    pub attempts: u32,
    pub tokens: u64,
    pub cost: f64,
}

/// Token and cost totals for an execution, summed over every recorded attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub attempts: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Per-step breakdown in first-seen order.
    pub steps: Vec<StepUsage>,
}

/// What `get_execution` returns: the execution plus its usage totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: Execution,
    pub usage: UsageSummary,
}
