//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `promptchain-core` using sqlx with split
//! read/write pools. Workflow definitions and execution snapshots are stored as
//! JSON blobs. Step attempts are append-only rows; execution reads load the
//! header and its attempts inside one read transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use promptchain_core::repository::workflow::WorkflowRepository;
use promptchain_types::error::RepositoryError;
use promptchain_types::workflow::{
    ApprovalRecord, Execution, ExecutionStatus, FailureType, StepAttempt, StepDefinition,
    WorkflowDefinition,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_name, status, current_step_index, \
     snapshot, approvals, failure_reason, narrative, created_at, started_at, finished_at";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowDefRow {
    definition: String,
}

impl WorkflowDefRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    current_step_index: i64,
    snapshot: String,
    approvals: String,
    failure_reason: Option<String>,
    narrative: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            snapshot: row.try_get("snapshot")?,
            approvals: row.try_get("approvals")?,
            failure_reason: row.try_get("failure_reason")?,
            narrative: row.try_get("narrative")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let snapshot: Vec<StepDefinition> = serde_json::from_str(&self.snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot JSON: {e}")))?;
        let approvals: Vec<ApprovalRecord> = serde_json::from_str(&self.approvals)
            .map_err(|e| RepositoryError::Query(format!("invalid approvals JSON: {e}")))?;
        let current_step_index = usize::try_from(self.current_step_index).map_err(|_| {
            RepositoryError::Query(format!(
                "invalid current_step_index: {}",
                self.current_step_index
            ))
        })?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            snapshot,
            status,
            current_step_index,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            failure_reason: self.failure_reason,
            narrative: self.narrative,
            approvals,
            attempts: Vec::new(),
        })
    }
}

struct StepAttemptRow {
    id: String,
    execution_id: String,
    step_id: String,
    attempt_number: i64,
    model: String,
    prompt_sent: String,
    response: Option<String>,
    tokens_used: Option<i64>,
    criteria_passed: bool,
    failure_type: Option<String>,
    failure_reason: Option<String>,
    created_at: String,
}

impl StepAttemptRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            attempt_number: row.try_get("attempt_number")?,
            model: row.try_get("model")?,
            prompt_sent: row.try_get("prompt_sent")?,
            response: row.try_get("response")?,
            tokens_used: row.try_get("tokens_used")?,
            criteria_passed: row.try_get("criteria_passed")?,
            failure_type: row.try_get("failure_type")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_attempt(self) -> Result<StepAttempt, RepositoryError> {
        let failure_type = self
            .failure_type
            .as_deref()
            .map(|s| s.parse::<FailureType>().map_err(RepositoryError::Query))
            .transpose()?;
        let attempt_number = u32::try_from(self.attempt_number).map_err(|_| {
            RepositoryError::Query(format!("invalid attempt_number: {}", self.attempt_number))
        })?;

        Ok(StepAttempt {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            attempt_number,
            model: self.model,
            prompt_sent: self.prompt_sent,
            response: self.response,
            tokens_used: self.tokens_used.and_then(|t| u32::try_from(t).ok()),
            criteria_passed: self.criteria_passed,
            failure_type,
            failure_reason: self.failure_reason,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Fixed-width UTC timestamp, so lease expiry compares correctly as text.
fn format_lease_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn rows_to_executions(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Execution>, RepositoryError> {
    let mut executions = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ExecutionRow::from_row(row).map_err(query_err)?;
        executions.push(r.into_execution()?);
    }
    Ok(executions)
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT id, definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = WorkflowDefRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT id, definition FROM workflows ORDER BY created_at DESC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowDefRow::from_row(row).map_err(query_err)?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn has_executions(&self, workflow_id: &Uuid) -> Result<bool, RepositoryError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM executions WHERE workflow_id = ?)")
                .bind(workflow_id.to_string())
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_err)?;
        Ok(exists)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(&execution.snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;
        let approvals = serde_json::to_string(&execution.approvals)
            .map_err(|e| RepositoryError::Query(format!("serialize approvals: {e}")))?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, workflow_name, status, current_step_index, snapshot,
                approvals, failure_reason, narrative, created_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.workflow_name)
        .bind(execution.status.to_string())
        .bind(execution.current_step_index as i64)
        .bind(&snapshot)
        .bind(&approvals)
        .bind(&execution.failure_reason)
        .bind(&execution.narrative)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        holder: &str,
    ) -> Result<(), RepositoryError> {
        let approvals = serde_json::to_string(&execution.approvals)
            .map_err(|e| RepositoryError::Query(format!("serialize approvals: {e}")))?;

        // MAX keeps the step index monotonic even if a stale copy is written.
        // The lease check and the write are one statement.
        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?,
                 current_step_index = MAX(current_step_index, ?),
                 approvals = ?,
                 failure_reason = ?,
                 narrative = ?,
                 started_at = ?,
                 finished_at = ?
               WHERE id = ?
                 AND NOT EXISTS (
                   SELECT 1 FROM execution_leases
                   WHERE execution_id = executions.id
                     AND holder <> ?
                     AND expires_at > ?
                 )"#,
        )
        .bind(execution.status.to_string())
        .bind(execution.current_step_index as i64)
        .bind(&approvals)
        .bind(&execution.failure_reason)
        .bind(&execution.narrative)
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.finished_at.as_ref().map(format_datetime))
        .bind(execution.id.to_string())
        .bind(holder)
        .bind(format_lease_time(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM executions WHERE id = ?)")
                    .bind(execution.id.to_string())
                    .fetch_one(&self.pool.writer)
                    .await
                    .map_err(query_err)?;
            if !exists {
                return Err(RepositoryError::NotFound);
            }
            return Err(RepositoryError::Conflict(format!(
                "execution {} is leased by another holder",
                execution.id
            )));
        }

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let mut tx = self.pool.reader.begin().await.map_err(query_err)?;

        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut execution = ExecutionRow::from_row(&row)
            .map_err(query_err)?
            .into_execution()?;

        let rows = sqlx::query("SELECT * FROM step_attempts WHERE execution_id = ? ORDER BY rowid ASC")
            .bind(id.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepAttemptRow::from_row(row).map_err(query_err)?;
            attempts.push(r.into_attempt()?);
        }
        execution.attempts = attempts;

        Ok(Some(execution))
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE workflow_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(workflow_id.to_string())
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        rows_to_executions(&rows)
    }

    async fn list_unfinished_executions(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     WHERE status IN ('pending', 'running', 'paused') AND workflow_id = ? \
                     ORDER BY created_at ASC, id ASC"
                );
                sqlx::query(&sql)
                    .bind(workflow_id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     WHERE status IN ('pending', 'running', 'paused') \
                     ORDER BY created_at ASC, id ASC"
                );
                sqlx::query(&sql).fetch_all(&self.pool.reader).await
            }
        }
        .map_err(query_err)?;

        rows_to_executions(&rows)
    }

    async fn append_attempt(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_attempts
               (id, execution_id, step_id, attempt_number, model, prompt_sent, response,
                tokens_used, criteria_passed, failure_type, failure_reason, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.execution_id.to_string())
        .bind(&attempt.step_id)
        .bind(attempt.attempt_number as i64)
        .bind(&attempt.model)
        .bind(&attempt.prompt_sent)
        .bind(&attempt.response)
        .bind(attempt.tokens_used.map(i64::from))
        .bind(attempt.criteria_passed)
        .bind(attempt.failure_type.map(|f| f.to_string()))
        .bind(&attempt.failure_reason)
        .bind(format_datetime(&attempt.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "attempt {} of step '{}' already recorded for execution {}",
                    attempt.attempt_number, attempt.step_id, attempt.execution_id
                ))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn acquire_lease(
        &self,
        execution_id: &Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // One statement: the conditional upsert is atomic across processes.
        let result = sqlx::query(
            r#"INSERT INTO execution_leases (execution_id, holder, expires_at)
               VALUES (?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
                 holder = excluded.holder,
                 expires_at = excluded.expires_at
               WHERE execution_leases.holder = excluded.holder
                  OR execution_leases.expires_at <= ?"#,
        )
        .bind(execution_id.to_string())
        .bind(holder)
        .bind(format_lease_time(&expires_at))
        .bind(format_lease_time(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, execution_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM execution_leases WHERE execution_id = ? AND holder = ?")
            .bind(execution_id.to_string())
            .bind(holder)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
