//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, step
//! attempts and execution leases. The infrastructure layer (promptchain-infra)
//! implements this trait with SQLite persistence; `InMemoryWorkflowRepository`
//! backs the engine tests.

use chrono::{DateTime, Utc};
use promptchain_types::error::RepositoryError;
use promptchain_types::workflow::{Execution, StepAttempt, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** save and query workflow definitions.
/// - **Executions:** create, update and read run instances. Reads return the
///   execution together with its attempts as one consistent snapshot.
/// - **Attempts:** append-only step attempt history.
/// - **Leases:** time-bounded exclusive ownership of an execution id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, newest first.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Whether any execution references the workflow.
    fn has_executions(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record, including its snapshot.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the mutable header fields of an execution: status,
    /// current_step_index, timestamps, failure reason, narrative, approvals.
    ///
    /// Implementations must never lower a stored `current_step_index`.
    /// Attempts and the snapshot are not touched.
    ///
    /// The write is refused with `Conflict` while a holder other than
    /// `holder` has a live lease on the execution.
    fn update_execution(
        &self,
        execution: &Execution,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution with its full attempt history.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions (without attempts), newest first, optionally for one workflow.
    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Executions that are pending, running or paused (without attempts).
    fn list_unfinished_executions(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Durably append one attempt. Duplicate `(execution_id, step_id,
    /// attempt_number)` triples are rejected with `Conflict`.
    fn append_attempt(
        &self,
        attempt: &StepAttempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Take or extend the lease on an execution.
    ///
    /// Succeeds when no lease exists, the existing lease has expired, or
    /// `holder` already owns it. Returns `false` when another holder has a
    /// live lease.
    fn acquire_lease(
        &self,
        execution_id: &Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the lease if `holder` owns it.
    fn release_lease(
        &self,
        execution_id: &Uuid,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
