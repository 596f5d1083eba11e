//! In-memory `WorkflowRepository`.
//!
//! Keeps everything behind one mutex so every read observes a consistent
//! snapshot. Used by the engine tests and handy for embedding the engine
//! without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use promptchain_types::error::RepositoryError;
use promptchain_types::workflow::{Execution, StepAttempt, WorkflowDefinition};
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    /// Executions stored without attempts; attempts live in `attempts`.
    executions: HashMap<Uuid, Execution>,
    attempts: HashMap<Uuid, Vec<StepAttempt>>,
    leases: HashMap<Uuid, (String, DateTime<Utc>)>,
}

/// Mutex-guarded maps implementing the full repository contract.
///
/// Clones share the same state, like two connections to one database.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicked test thread must not wedge every later call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn header(execution: &Execution) -> Execution {
    Execution {
        attempts: Vec::new(),
        ..execution.clone()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        let def = def.clone();
        async move {
            self.lock().definitions.insert(def.id, def);
            Ok(())
        }
    }

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send
    {
        let id = *id;
        async move { Ok(self.lock().definitions.get(&id).cloned()) }
    }

    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send
    {
        async move {
            let mut defs: Vec<_> = self.lock().definitions.values().cloned().collect();
            defs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(defs)
        }
    }

    fn has_executions(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send {
        let workflow_id = *workflow_id;
        async move {
            Ok(self
                .lock()
                .executions
                .values()
                .any(|e| e.workflow_id == workflow_id))
        }
    }

    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        let execution = header(execution);
        async move {
            let mut state = self.lock();
            if state.executions.contains_key(&execution.id) {
                return Err(RepositoryError::Conflict(format!(
                    "execution {} already exists",
                    execution.id
                )));
            }
            state.attempts.insert(execution.id, Vec::new());
            state.executions.insert(execution.id, execution);
            Ok(())
        }
    }

    fn update_execution(
        &self,
        execution: &Execution,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        let update = header(execution);
        let holder = holder.to_string();
        async move {
            let mut state = self.lock();
            let now = Utc::now();
            if let Some((owner, _)) = state
                .leases
                .get(&update.id)
                .filter(|(owner, until)| *owner != holder && *until > now)
            {
                return Err(RepositoryError::Conflict(format!(
                    "execution {} is leased by {owner}",
                    update.id
                )));
            }
            let stored = state
                .executions
                .get_mut(&update.id)
                .ok_or(RepositoryError::NotFound)?;
            stored.status = update.status;
            stored.current_step_index = stored.current_step_index.max(update.current_step_index);
            stored.started_at = update.started_at;
            stored.finished_at = update.finished_at;
            stored.failure_reason = update.failure_reason;
            stored.narrative = update.narrative;
            stored.approvals = update.approvals;
            Ok(())
        }
    }

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send {
        let id = *id;
        async move {
            let state = self.lock();
            Ok(state.executions.get(&id).map(|e| Execution {
                attempts: state.attempts.get(&id).cloned().unwrap_or_default(),
                ..e.clone()
            }))
        }
    }

    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send {
        let workflow_id = workflow_id.copied();
        async move {
            let mut list: Vec<_> = self
                .lock()
                .executions
                .values()
                .filter(|e| workflow_id.is_none_or(|w| e.workflow_id == w))
                .cloned()
                .collect();
            list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            list.truncate(limit as usize);
            Ok(list)
        }
    }

    fn list_unfinished_executions(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send {
        let workflow_id = workflow_id.copied();
        async move {
            let mut list: Vec<_> = self
                .lock()
                .executions
                .values()
                .filter(|e| !e.status.is_terminal())
                .filter(|e| workflow_id.is_none_or(|w| e.workflow_id == w))
                .cloned()
                .collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(list)
        }
    }

    fn append_attempt(
        &self,
        attempt: &StepAttempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        let attempt = attempt.clone();
        async move {
            let mut state = self.lock();
            let history = state
                .attempts
                .get_mut(&attempt.execution_id)
                .ok_or(RepositoryError::NotFound)?;
            if history.iter().any(|a| {
                a.step_id == attempt.step_id && a.attempt_number == attempt.attempt_number
            }) {
                return Err(RepositoryError::Conflict(format!(
                    "attempt {} of step '{}' already recorded",
                    attempt.attempt_number, attempt.step_id
                )));
            }
            history.push(attempt);
            Ok(())
        }
    }

    fn acquire_lease(
        &self,
        execution_id: &Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send {
        let execution_id = *execution_id;
        let holder = holder.to_string();
        async move {
            let mut state = self.lock();
            let now = Utc::now();
            let free = match state.leases.get(&execution_id) {
                None => true,
                Some((owner, until)) => *owner == holder || *until <= now,
            };
            if free {
                state.leases.insert(execution_id, (holder, expires_at));
            }
            Ok(free)
        }
    }

    fn release_lease(
        &self,
        execution_id: &Uuid,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        let execution_id = *execution_id;
        let holder = holder.to_string();
        async move {
            let mut state = self.lock();
            if state
                .leases
                .get(&execution_id)
                .is_some_and(|(owner, _)| *owner == holder)
            {
                state.leases.remove(&execution_id);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use promptchain_types::workflow::{
        CompletionCriterion, ContextStrategy, CriterionCheck, ExecutionStatus, StepDefinition,
    };

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "mem".to_string(),
            description: None,
            steps: vec![StepDefinition {
                id: "only".to_string(),
                order_index: 0,
                model: "m".to_string(),
                prompt: "p".to_string(),
                criterion: CompletionCriterion::new(CriterionCheck::ValidJson),
                context_strategy: ContextStrategy::Full,
                requires_approval: false,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn attempt(execution_id: Uuid, number: u32) -> StepAttempt {
        StepAttempt {
            id: Uuid::now_v7(),
            execution_id,
            step_id: "only".to_string(),
            attempt_number: number,
            model: "m".to_string(),
            prompt_sent: "p".to_string(),
            response: Some("{}".to_string()),
            tokens_used: Some(10),
            criteria_passed: true,
            failure_type: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn update_never_lowers_step_index() {
        let repo = InMemoryWorkflowRepository::new();
        let def = definition();
        let mut execution = Execution::new(&def, def.ordered_steps());
        repo.create_execution(&execution).await.unwrap();

        execution.current_step_index = 2;
        repo.update_execution(&execution, "a").await.unwrap();
        execution.current_step_index = 1;
        execution.status = ExecutionStatus::Running;
        repo.update_execution(&execution, "a").await.unwrap();

        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_index, 2);
        assert_eq!(stored.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn duplicate_attempt_number_conflicts() {
        let repo = InMemoryWorkflowRepository::new();
        let def = definition();
        let execution = Execution::new(&def, def.ordered_steps());
        repo.create_execution(&execution).await.unwrap();

        repo.append_attempt(&attempt(execution.id, 1)).await.unwrap();
        let err = repo
            .append_attempt(&attempt(execution.id, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts.len(), 1);
        assert!(repo.has_executions(&def.id).await.unwrap());
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_until_expiry() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        let later = Utc::now() + Duration::minutes(5);

        assert!(repo.acquire_lease(&id, "a", later).await.unwrap());
        assert!(!repo.acquire_lease(&id, "b", later).await.unwrap());
        // Re-entrant for the owner.
        assert!(repo.acquire_lease(&id, "a", later).await.unwrap());

        // Releasing someone else's lease does nothing.
        repo.release_lease(&id, "b").await.unwrap();
        assert!(!repo.acquire_lease(&id, "b", later).await.unwrap());

        repo.release_lease(&id, "a").await.unwrap();
        assert!(repo.acquire_lease(&id, "b", later).await.unwrap());

        let expired = Uuid::now_v7();
        let past = Utc::now() - Duration::seconds(1);
        assert!(repo.acquire_lease(&expired, "a", past).await.unwrap());
        assert!(repo.acquire_lease(&expired, "b", later).await.unwrap());
    }

    #[tokio::test]
    async fn update_refused_while_another_holder_has_the_lease() {
        let repo = InMemoryWorkflowRepository::new();
        let def = definition();
        let mut execution = Execution::new(&def, def.ordered_steps());
        repo.create_execution(&execution).await.unwrap();
        let later = Utc::now() + Duration::minutes(5);
        assert!(repo.acquire_lease(&execution.id, "b", later).await.unwrap());

        execution.status = ExecutionStatus::Failed;
        let err = repo.update_execution(&execution, "a").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);

        // The owner writes; an expired foreign lease no longer blocks.
        repo.update_execution(&execution, "b").await.unwrap();
        let past = Utc::now() - Duration::seconds(1);
        repo.release_lease(&execution.id, "b").await.unwrap();
        assert!(repo.acquire_lease(&execution.id, "b", past).await.unwrap());
        execution.status = ExecutionStatus::Cancelled;
        repo.update_execution(&execution, "a").await.unwrap();
        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let repo = InMemoryWorkflowRepository::new();
        let other = repo.clone();
        let def = definition();
        repo.save_definition(&def).await.unwrap();
        assert!(other.get_definition(&def.id).await.unwrap().is_some());
    }
}
