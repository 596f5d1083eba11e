//! Execution controller: the state machine that drives a workflow run.
//!
//! ```text
//! pending -> running -> paused -> running -> ... -> completed
//!                    \-> failed
//! pending | running | paused -> cancelled
//! ```
//!
//! # Execution flow
//!
//! 1. `launch` freezes the workflow's steps into a snapshot, persists the
//!    execution and marks it running.
//! 2. `advance` takes the execution lease and pulls steps in order, handing
//!    each to the `StepRunner` with the context built from the previous step.
//! 3. A passing step moves `current_step_index` forward; a passing gated step
//!    pauses the run; an exhausted step or a fatal provider error fails it.
//! 4. `approve` (under the same lease) moves a paused run past its gate.
//!
//! Every mutation of an execution happens while holding both the in-process
//! lease and the store lease for its id. While `advance` runs, a heartbeat
//! renews the store lease every third of its TTL; if a renewal fails the
//! advance stops without writing and the execution stays running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use promptchain_types::config::GlobalConfig;
use promptchain_types::event::WorkflowEvent;
use promptchain_types::llm::LlmError;
use promptchain_types::workflow::{
    ApprovalRecord, Execution, ExecutionStatus, ExecutionView, StepAttempt, StepDefinition,
    WorkflowDefinition,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::llm::provider::LlmProvider;
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::ContextBuilder;
use super::cost::{CostAccountant, format_cost};
use super::definition::validate_definition;
use super::lease::ExecutionLeases;
use super::step_runner::{StepError, StepOutcome, StepRunner, StepRunnerSettings};

/// Note recorded when an operator approves without writing one.
pub const DEFAULT_APPROVAL_NOTE: &str = "Approved by user";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of the controller.
///
/// Per-attempt failures never appear here: they are recorded on the attempt
/// and turned into status transitions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow {0} cannot be edited because executions already exist")]
    ImmutableDefinition(Uuid),

    #[error("execution {execution_id} is {status}: {reason}")]
    InvalidState {
        execution_id: Uuid,
        status: ExecutionStatus,
        reason: String,
    },

    #[error("workflow '{workflow}' already has an unfinished execution {execution_id}")]
    RunInProgress { workflow: String, execution_id: Uuid },

    #[error("execution {0} is leased by another controller")]
    LeaseUnavailable(Uuid),

    #[error("execution {execution_id} failed at step '{step_id}' attempt {attempt}: {source}")]
    ProviderTransport {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    Checkpoint(CheckpointError),
}

impl From<CheckpointError> for EngineError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
            CheckpointError::LeaseLost(id) => EngineError::LeaseUnavailable(id),
            other => EngineError::Checkpoint(other),
        }
    }
}

impl EngineError {
    fn invalid_state(execution: &Execution, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            execution_id: execution.id,
            status: execution.status,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionController
// ---------------------------------------------------------------------------

/// Owns execution records and moves them through the state machine.
///
/// Generic over `R: WorkflowRepository` for storage and `P: LlmProvider` for
/// the model backend.
pub struct ExecutionController<R: WorkflowRepository, P: LlmProvider> {
    checkpoint: Arc<CheckpointManager<R>>,
    step_runner: StepRunner<P>,
    context_builder: ContextBuilder,
    accountant: CostAccountant,
    event_bus: EventBus,
    leases: ExecutionLeases,
    /// Cancellation tokens for executions this process is advancing.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    /// Identifies this controller in store leases.
    holder_id: String,
    lease_ttl: Duration,
    single_active_run: bool,
}

impl<R: WorkflowRepository, P: LlmProvider> ExecutionController<R, P> {
    pub fn new(repo: R, provider: P, event_bus: EventBus, config: &GlobalConfig) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            step_runner: StepRunner::new(
                provider,
                StepRunnerSettings::from_config(config),
                event_bus.clone(),
            ),
            context_builder: ContextBuilder::new(config.engine.truncate_chars),
            accountant: CostAccountant::new(config.pricing.clone(), config.default_price_per_1k),
            event_bus,
            leases: ExecutionLeases::new(),
            cancellation_tokens: DashMap::new(),
            holder_id: format!("{}-{}", std::process::id(), Uuid::now_v7()),
            lease_ttl: Duration::from_secs(config.engine.lease_ttl_secs.max(1)),
            single_active_run: config.engine.single_active_run,
        }
    }

    /// Access the underlying repository (for read-only listings).
    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn accountant(&self) -> &CostAccountant {
        &self.accountant
    }

    /// The concrete model a step will invoke.
    pub fn resolve_model(&self, step: &StepDefinition) -> String {
        self.step_runner.resolve_model(step)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a workflow definition.
    ///
    /// Once an execution references a workflow its steps are frozen: saving
    /// different steps under the same id fails with `ImmutableDefinition`.
    pub async fn register_definition(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&def).map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;

        let repo = self.checkpoint.repo();
        if let Some(existing) = repo.get_definition(&def.id).await.map_err(repo_err)? {
            if repo.has_executions(&def.id).await.map_err(repo_err)? && existing.steps != def.steps {
                return Err(EngineError::ImmutableDefinition(def.id));
            }
            def.created_at = existing.created_at;
        }
        def.updated_at = Utc::now();

        repo.save_definition(&def).await.map_err(repo_err)?;
        tracing::info!(
            workflow_id = %def.id,
            workflow = def.name.as_str(),
            steps = def.steps.len(),
            "registered workflow definition"
        );
        Ok(def)
    }

    /// Estimated cost of one clean pass through a workflow.
    pub async fn estimate(&self, workflow_id: Uuid) -> Result<f64, EngineError> {
        let def = self
            .checkpoint
            .repo()
            .get_definition(&workflow_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        Ok(self
            .accountant
            .estimate_workflow_cost(&def.steps, |s| self.step_runner.resolve_model(s)))
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Start a new execution of `workflow_id` and return its id.
    ///
    /// The execution is persisted and marked running; call `advance` to
    /// actually run its steps.
    pub async fn launch(&self, workflow_id: Uuid) -> Result<Uuid, EngineError> {
        // Serialize launches of one workflow so the single-run check holds.
        let guard = self.leases.acquire(workflow_id).await;
        let result = self.launch_locked(workflow_id).await;
        drop(guard);
        self.leases.prune(&workflow_id);
        result
    }

    async fn launch_locked(&self, workflow_id: Uuid) -> Result<Uuid, EngineError> {
        let repo = self.checkpoint.repo();
        let def = repo
            .get_definition(&workflow_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        if def.steps.is_empty() {
            return Err(EngineError::EmptyWorkflow(def.name));
        }

        if self.single_active_run {
            let unfinished = repo
                .list_unfinished_executions(Some(&workflow_id))
                .await
                .map_err(repo_err)?;
            if let Some(active) = unfinished.first() {
                return Err(EngineError::RunInProgress {
                    workflow: def.name,
                    execution_id: active.id,
                });
            }
        }

        let mut execution = Execution::new(&def, def.ordered_steps());
        self.checkpoint.create_execution(&execution).await?;

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.checkpoint
            .save_execution(&execution, &self.holder_id)
            .await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow = def.name.as_str(),
            steps = execution.snapshot.len(),
            "launched execution"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution.id,
            workflow_name: def.name,
            step_count: execution.snapshot.len(),
        });

        Ok(execution.id)
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Run steps until the execution pauses or finishes.
    ///
    /// A no-op for paused and terminal executions. Returns the execution as
    /// persisted when the loop stopped. A fatal provider error is persisted
    /// as a failed execution and also returned as `ProviderTransport`.
    /// Losing the store lease mid-run returns `LeaseUnavailable` and leaves
    /// the record untouched for the new holder.
    pub async fn advance(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let local = self.leases.acquire(execution_id).await;
        let result = match self.claim_lease(execution_id).await {
            Ok(()) => {
                let token = CancellationToken::new();
                self.cancellation_tokens.insert(execution_id, token.clone());
                // Fired by a user cancel or by losing the store lease.
                let stop = token.child_token();
                let done = CancellationToken::new();
                let (result, ()) = tokio::join!(
                    async {
                        let result = self.drive(execution_id, &token, &stop).await;
                        done.cancel();
                        result
                    },
                    self.renew_lease(execution_id, &done, &stop),
                );
                self.cancellation_tokens.remove(&execution_id);
                self.checkpoint
                    .release_lease(execution_id, &self.holder_id)
                    .await;
                result
            }
            Err(e) => Err(e),
        };
        drop(local);
        self.leases.prune(&execution_id);
        result
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<Execution, EngineError> {
        let mut execution = self.checkpoint.load_execution(execution_id).await?;

        match execution.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Pending => {
                execution.status = ExecutionStatus::Running;
                execution.started_at.get_or_insert_with(Utc::now);
                self.checkpoint
                    .save_execution(&execution, &self.holder_id)
                    .await?;
            }
            ExecutionStatus::Paused
            | ExecutionStatus::Completed
            | ExecutionStatus::Failed
            | ExecutionStatus::Cancelled => {
                tracing::debug!(
                    execution_id = %execution_id,
                    status = %execution.status,
                    "nothing to advance"
                );
                return Ok(execution);
            }
        }

        loop {
            if stop.is_cancelled() {
                return self.stand_down(execution, cancel).await;
            }
            let Some(step) = execution.current_step().cloned() else {
                return self.finish_completed(execution).await;
            };

            let previous_step_id = execution
                .current_step_index
                .checked_sub(1)
                .and_then(|i| execution.snapshot.get(i))
                .map(|s| s.id.as_str());
            let context = self.context_builder.build(
                &execution.attempts,
                previous_step_id,
                step.context_strategy,
            );
            let prior: Vec<StepAttempt> = execution.attempts_for(&step.id).cloned().collect();

            tracing::info!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                step_index = execution.current_step_index,
                steps = execution.snapshot.len(),
                "running step"
            );

            let outcome = self
                .step_runner
                .run_step(
                    &self.checkpoint,
                    execution_id,
                    &step,
                    &context,
                    &prior,
                    stop,
                )
                .await;

            // Pick up the attempts the runner just recorded.
            execution = self.checkpoint.load_execution(execution_id).await?;

            match outcome {
                Ok(StepOutcome::Advance(_)) => {
                    execution.current_step_index += 1;
                    self.event_bus.publish(WorkflowEvent::StepAdvanced {
                        execution_id,
                        step_id: step.id.clone(),
                        next_step_index: execution.current_step_index,
                    });
                    if execution.current_step().is_none() {
                        return self.finish_completed(execution).await;
                    }
                    self.checkpoint
                        .save_execution(&execution, &self.holder_id)
                        .await?;
                    if let Err(e) = self.claim_lease(execution_id).await {
                        tracing::error!(
                            execution_id = %execution_id,
                            step_index = execution.current_step_index,
                            error = %e,
                            "lost execution lease between steps; left running for the holder"
                        );
                        return Err(e);
                    }
                }
                Ok(StepOutcome::Paused(_)) => {
                    execution.status = ExecutionStatus::Paused;
                    execution.narrative = Some(self.narrate(&execution));
                    self.checkpoint
                        .save_execution(&execution, &self.holder_id)
                        .await?;

                    tracing::info!(
                        execution_id = %execution_id,
                        step_id = step.id.as_str(),
                        "execution paused for approval"
                    );
                    self.event_bus.publish(WorkflowEvent::ExecutionPaused {
                        execution_id,
                        workflow_name: execution.workflow_name.clone(),
                        step_id: step.id.clone(),
                    });
                    return Ok(execution);
                }
                Ok(StepOutcome::Exhausted(attempts)) => {
                    let last = attempts.last();
                    let reason = format!(
                        "step '{}' exhausted its retry budget after {} attempts; attempt {} failed: {}",
                        step.id,
                        attempts.len(),
                        last.map(|a| a.attempt_number).unwrap_or(0),
                        last.and_then(|a| a.failure_reason.as_deref())
                            .unwrap_or("no failure reason recorded"),
                    );
                    return self.finish_failed(execution, reason).await;
                }
                Err(StepError::Cancelled { .. }) => {
                    return self.stand_down(execution, cancel).await;
                }
                Err(StepError::ProviderTransport {
                    step_id,
                    attempt,
                    source,
                }) => {
                    let reason =
                        format!("step '{step_id}' attempt {attempt}: provider error: {source}");
                    self.finish_failed(execution, reason).await?;
                    return Err(EngineError::ProviderTransport {
                        execution_id,
                        step_id,
                        attempt,
                        source,
                    });
                }
                Err(StepError::Checkpoint(e)) => {
                    // Left running; the next advance resumes from the store.
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "failed to persist step progress"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// End an interrupted drive. A user cancel is persisted; a lost lease
    /// leaves the record to whoever holds the lease now.
    async fn stand_down(
        &self,
        execution: Execution,
        cancel: &CancellationToken,
    ) -> Result<Execution, EngineError> {
        if cancel.is_cancelled() {
            return self.finish_cancelled(execution).await;
        }
        tracing::error!(
            execution_id = %execution.id,
            step_index = execution.current_step_index,
            "advance stopped after losing the execution lease; left running"
        );
        Err(EngineError::LeaseUnavailable(execution.id))
    }

    async fn finish_completed(&self, mut execution: Execution) -> Result<Execution, EngineError> {
        execution.status = ExecutionStatus::Completed;
        execution.finished_at = Some(Utc::now());
        execution.narrative = Some(self.narrate(&execution));
        self.checkpoint
            .save_execution(&execution, &self.holder_id)
            .await?;

        let usage = self.accountant.summarize(&execution.attempts);
        tracing::info!(
            execution_id = %execution.id,
            workflow = execution.workflow_name.as_str(),
            attempts = usage.attempts,
            tokens = usage.total_tokens,
            "execution completed"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionCompleted {
            execution_id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            total_tokens: usage.total_tokens,
            total_cost: usage.total_cost,
        });
        Ok(execution)
    }

    async fn finish_failed(
        &self,
        mut execution: Execution,
        reason: String,
    ) -> Result<Execution, EngineError> {
        execution.status = ExecutionStatus::Failed;
        execution.finished_at = Some(Utc::now());
        execution.failure_reason = Some(reason.clone());
        execution.narrative = Some(self.narrate(&execution));
        self.checkpoint
            .save_execution(&execution, &self.holder_id)
            .await?;

        tracing::error!(
            execution_id = %execution.id,
            workflow = execution.workflow_name.as_str(),
            reason = reason.as_str(),
            "execution failed"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionFailed {
            execution_id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            reason,
        });
        Ok(execution)
    }

    async fn finish_cancelled(&self, mut execution: Execution) -> Result<Execution, EngineError> {
        execution.status = ExecutionStatus::Cancelled;
        execution.finished_at = Some(Utc::now());
        execution.narrative = Some(self.narrate(&execution));
        self.checkpoint
            .save_execution(&execution, &self.holder_id)
            .await?;

        tracing::info!(execution_id = %execution.id, "execution cancelled");
        self.event_bus.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: execution.id,
        });
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Approve
    // -----------------------------------------------------------------------

    /// Sign off the approval gate a paused execution is waiting on.
    ///
    /// Moves past the gated step and marks the execution running (or
    /// completed when the gate was the last step). Call `advance` afterwards
    /// to run the remaining steps. Anything other than a paused execution at
    /// a passed, gated step is rejected with `InvalidState` and left as is.
    pub async fn approve(
        &self,
        execution_id: Uuid,
        note: Option<String>,
    ) -> Result<Execution, EngineError> {
        // Reject obvious misuse without queueing behind an in-flight advance.
        let current = self.checkpoint.load_execution(execution_id).await?;
        if current.status != ExecutionStatus::Paused {
            return Err(EngineError::invalid_state(
                &current,
                "only paused executions can be approved",
            ));
        }

        let local = self.leases.acquire(execution_id).await;
        let result = match self.claim_lease(execution_id).await {
            Ok(()) => {
                let result = self.approve_locked(execution_id, note).await;
                self.checkpoint
                    .release_lease(execution_id, &self.holder_id)
                    .await;
                result
            }
            Err(e) => Err(e),
        };
        drop(local);
        self.leases.prune(&execution_id);
        result
    }

    async fn approve_locked(
        &self,
        execution_id: Uuid,
        note: Option<String>,
    ) -> Result<Execution, EngineError> {
        let mut execution = self.checkpoint.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(EngineError::invalid_state(
                &execution,
                "only paused executions can be approved",
            ));
        }

        let Some(step) = execution.current_step().cloned() else {
            return Err(EngineError::invalid_state(
                &execution,
                "paused past the last step",
            ));
        };
        if !step.requires_approval {
            return Err(EngineError::invalid_state(
                &execution,
                format!("step '{}' does not require approval", step.id),
            ));
        }
        let gate_passed = execution
            .attempts_for(&step.id)
            .last()
            .is_some_and(|a| a.criteria_passed);
        if !gate_passed {
            return Err(EngineError::invalid_state(
                &execution,
                format!("step '{}' has no passing attempt to approve", step.id),
            ));
        }

        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_APPROVAL_NOTE.to_string());
        execution.approvals.push(ApprovalRecord {
            step_id: step.id.clone(),
            note: note.clone(),
            approved_at: Utc::now(),
        });
        execution.current_step_index += 1;

        tracing::info!(
            execution_id = %execution_id,
            step_id = step.id.as_str(),
            note = note.as_str(),
            "approval gate signed off"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionApproved {
            execution_id,
            step_id: step.id.clone(),
            note,
        });

        if execution.current_step().is_none() {
            return self.finish_completed(execution).await;
        }

        execution.status = ExecutionStatus::Running;
        execution.narrative = None;
        self.checkpoint
            .save_execution(&execution, &self.holder_id)
            .await?;
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Move an unfinished execution to `cancelled`.
    ///
    /// An advance in flight in this process is interrupted at its next
    /// suspension point; the call waits for it to stand down.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let current = self.checkpoint.load_execution(execution_id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::invalid_state(
                &current,
                "execution has already finished",
            ));
        }
        if let Some(token) = self.cancellation_tokens.get(&execution_id) {
            token.cancel();
        }

        let local = self.leases.acquire(execution_id).await;
        let result = match self.claim_lease(execution_id).await {
            Ok(()) => {
                let result = match self.checkpoint.load_execution(execution_id).await {
                    Ok(execution) if execution.status == ExecutionStatus::Cancelled => {
                        Ok(execution)
                    }
                    Ok(execution) if execution.status.is_terminal() => Err(
                        EngineError::invalid_state(&execution, "execution has already finished"),
                    ),
                    Ok(execution) => self.finish_cancelled(execution).await,
                    Err(e) => Err(e.into()),
                };
                self.checkpoint
                    .release_lease(execution_id, &self.holder_id)
                    .await;
                result
            }
            Err(e) => Err(e),
        };
        drop(local);
        self.leases.prune(&execution_id);
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The full projection of an execution: record, attempts and usage totals.
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionView, EngineError> {
        let execution = self.checkpoint.load_execution(execution_id).await?;
        let usage = self.accountant.summarize(&execution.attempts);
        Ok(ExecutionView { execution, usage })
    }

    /// Executions a previous process left pending or running.
    ///
    /// Paused executions are excluded: they wait for an operator, not a
    /// controller.
    pub async fn resume_interrupted(&self) -> Result<Vec<Uuid>, EngineError> {
        let unfinished = self
            .checkpoint
            .repo()
            .list_unfinished_executions(None)
            .await
            .map_err(repo_err)?;
        Ok(unfinished
            .into_iter()
            .filter(|e| e.status.is_active())
            .map(|e| e.id)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn claim_lease(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let ttl = chrono::Duration::from_std(self.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let acquired = self
            .checkpoint
            .acquire_lease(execution_id, &self.holder_id, Utc::now() + ttl)
            .await?;
        if acquired {
            Ok(())
        } else {
            tracing::warn!(execution_id = %execution_id, "execution lease held elsewhere");
            Err(EngineError::LeaseUnavailable(execution_id))
        }
    }

    /// Keep the store lease alive until `done` fires. Cancels `lost` and
    /// returns if a renewal is refused or fails.
    async fn renew_lease(
        &self,
        execution_id: Uuid,
        done: &CancellationToken,
        lost: &CancellationToken,
    ) {
        let period = self.lease_ttl / 3;
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            if let Err(e) = self.claim_lease(execution_id).await {
                tracing::error!(
                    execution_id = %execution_id,
                    error = %e,
                    "failed to renew execution lease"
                );
                lost.cancel();
                return;
            }
        }
    }

    fn narrate(&self, execution: &Execution) -> String {
        let total = execution.snapshot.len();
        let usage = self.accountant.summarize(&execution.attempts);
        let spend = format!(
            "{} attempts, {} tokens, {}",
            usage.attempts,
            usage.total_tokens,
            format_cost(usage.total_cost)
        );
        let at_step = || {
            execution
                .current_step()
                .map(|s| format!("step '{}' ({} of {total})", s.id, execution.current_step_index + 1))
                .unwrap_or_else(|| format!("step {} of {total}", execution.current_step_index + 1))
        };

        match execution.status {
            ExecutionStatus::Completed => {
                let approvals = match execution.approvals.len() {
                    0 => String::new(),
                    1 => " with 1 approval".to_string(),
                    n => format!(" with {n} approvals"),
                };
                format!("Completed all {total} steps{approvals} ({spend}).")
            }
            ExecutionStatus::Paused => {
                format!("Paused for approval after {} passed ({spend}).", at_step())
            }
            ExecutionStatus::Failed => format!(
                "Failed at {}: {} ({spend}).",
                at_step(),
                execution.failure_reason.as_deref().unwrap_or("unknown cause")
            ),
            ExecutionStatus::Cancelled => format!("Cancelled at {} ({spend}).", at_step()),
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                format!("Running {} ({spend}).", at_step())
            }
        }
    }
}

fn repo_err(e: promptchain_types::error::RepositoryError) -> EngineError {
    EngineError::Checkpoint(CheckpointError::Repository(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
