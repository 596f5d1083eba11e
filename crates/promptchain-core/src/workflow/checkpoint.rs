//! Durable checkpoint manager for execution state.
//!
//! Wraps `WorkflowRepository` with the handful of operations the engine
//! needs: append an attempt, persist an execution header, reload an
//! execution, and hold the store-level lease. Every attempt is written here
//! before the engine acts on it, so a crash never loses recorded progress.

use chrono::{DateTime, Utc};
use promptchain_types::error::RepositoryError;
use promptchain_types::workflow::{Execution, StepAttempt};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Durably append a finished attempt.
    pub async fn record_attempt(&self, attempt: &StepAttempt) -> Result<(), CheckpointError> {
        self.repo
            .append_attempt(attempt)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %attempt.execution_id,
            step_id = attempt.step_id.as_str(),
            attempt = attempt.attempt_number,
            passed = attempt.criteria_passed,
            "checkpointed attempt"
        );

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Persist a newly launched execution together with its snapshot.
    pub async fn create_execution(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .create_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.id,
            steps = execution.snapshot.len(),
            "checkpointed new execution"
        );

        Ok(())
    }

    /// Persist status, step index and the other header fields on behalf of
    /// `holder`. Fails with `LeaseLost` if someone else holds the store lease.
    pub async fn save_execution(
        &self,
        execution: &Execution,
        holder: &str,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_execution(execution, holder)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => CheckpointError::LeaseLost(execution.id),
                other => CheckpointError::Repository(other.to_string()),
            })?;

        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            step_index = execution.current_step_index,
            "checkpointed execution status"
        );

        Ok(())
    }

    /// Reload an execution and its full attempt history.
    pub async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, CheckpointError> {
        self.repo
            .get_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }

    // -----------------------------------------------------------------------
    // Store lease
    // -----------------------------------------------------------------------

    /// Take or extend the store lease on an execution.
    pub async fn acquire_lease(
        &self,
        execution_id: Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CheckpointError> {
        self.repo
            .acquire_lease(&execution_id, holder, expires_at)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Drop the store lease. Failures are logged; the lease expires on its own.
    pub async fn release_lease(&self, execution_id: Uuid, holder: &str) {
        if let Err(e) = self.repo.release_lease(&execution_id, holder).await {
            tracing::warn!(
                execution_id = %execution_id,
                error = %e,
                "failed to release execution lease"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Another holder took over the store lease.
    #[error("execution {0} is leased by another holder")]
    LeaseLost(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));

        let err = CheckpointError::ExecutionNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn load_missing_execution_is_not_found() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let err = manager.load_execution(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn attempt_for_unknown_execution_is_repository_error() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let attempt = StepAttempt {
            id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            step_id: "a".to_string(),
            attempt_number: 1,
            model: "m".to_string(),
            prompt_sent: "p".to_string(),
            response: None,
            tokens_used: None,
            criteria_passed: false,
            failure_type: None,
            failure_reason: None,
            created_at: Utc::now(),
        };
        let err = manager.record_attempt(&attempt).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Repository(_)));
    }

    #[tokio::test]
    async fn save_under_foreign_lease_is_lease_lost() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let def = crate::testing::workflow(
            "chain",
            vec![crate::testing::step("a", 0, crate::testing::contains("OK"), 0)],
        );
        let execution = Execution::new(&def, def.ordered_steps());
        manager.create_execution(&execution).await.unwrap();

        let until = Utc::now() + chrono::Duration::minutes(5);
        assert!(manager.acquire_lease(execution.id, "other", until).await.unwrap());

        let err = manager.save_execution(&execution, "me").await.unwrap_err();
        assert!(matches!(err, CheckpointError::LeaseLost(id) if id == execution.id));
        manager.save_execution(&execution, "other").await.unwrap();
    }
}
