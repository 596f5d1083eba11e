//! Step runner: drives one step through its attempts.
//!
//! Each attempt composes the prompt from the step template and the forwarded
//! context, calls the provider, checks the response against the step's
//! criterion and durably records the result. Transient provider failures are
//! retried on the spot and never spend the criteria budget; criteria failures
//! are retried with a fresh provider call until `max_retries + 1` attempts
//! have been made.

use std::time::Duration;

use chrono::Utc;
use promptchain_types::config::GlobalConfig;
use promptchain_types::event::WorkflowEvent;
use promptchain_types::llm::{CompletionRequest, CompletionResponse, LlmError, Message};
use promptchain_types::workflow::{AUTO_MODEL, FailureType, StepAttempt, StepDefinition};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::llm::provider::LlmProvider;
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::compose_prompt;
use super::criteria::evaluate;

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// How a step ended.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Criterion passed; move to the next step.
    Advance(StepAttempt),
    /// Criterion passed on a gated step; wait for an operator.
    Paused(StepAttempt),
    /// Every allowed attempt failed. Holds all attempts of the step, oldest first.
    Exhausted(Vec<StepAttempt>),
}

/// Failures that end a step without a criterion verdict.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The provider failed in a way retries did not fix. A `provider_error`
    /// attempt has been recorded.
    #[error("step '{step_id}' attempt {attempt}: {source}")]
    ProviderTransport {
        step_id: String,
        attempt: u32,
        #[source]
        source: LlmError,
    },

    /// The cancellation token fired while the step was in flight.
    #[error("step '{step_id}' cancelled")]
    Cancelled { step_id: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

enum CallError {
    Cancelled,
    Provider(LlmError),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Provider-call policy for the step runner.
#[derive(Debug, Clone)]
pub struct StepRunnerSettings {
    /// Immediate retries after a transient provider failure, per attempt.
    pub transport_retries: u32,
    pub call_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Model for `auto` steps with a `regex` or `valid_json` criterion.
    pub auto_structured_model: String,
    /// Model for every other `auto` step.
    pub auto_default_model: String,
}

impl StepRunnerSettings {
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            transport_retries: config.engine.transport_retries,
            call_timeout: Duration::from_secs(config.engine.call_timeout_secs.max(1)),
            max_tokens: config.engine.max_tokens,
            temperature: config.engine.temperature,
            auto_structured_model: config.models.auto_structured.clone(),
            auto_default_model: config.models.auto_default.clone(),
        }
    }
}

impl Default for StepRunnerSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Runs steps against an `LlmProvider`.
pub struct StepRunner<P: LlmProvider> {
    provider: P,
    settings: StepRunnerSettings,
    event_bus: EventBus,
}

impl<P: LlmProvider> StepRunner<P> {
    pub fn new(provider: P, settings: StepRunnerSettings, event_bus: EventBus) -> Self {
        Self {
            provider,
            settings,
            event_bus,
        }
    }

    pub fn settings(&self) -> &StepRunnerSettings {
        &self.settings
    }

    /// The concrete model a step runs on.
    pub fn resolve_model(&self, step: &StepDefinition) -> String {
        if !step.model.eq_ignore_ascii_case(AUTO_MODEL) {
            return step.model.clone();
        }
        if step.criterion.check.is_structured() {
            self.settings.auto_structured_model.clone()
        } else {
            self.settings.auto_default_model.clone()
        }
    }

    /// Run `step` until it passes, pauses, or exhausts its budget.
    ///
    /// `prior` holds attempts already recorded for this step by an earlier
    /// controller that stopped before acting on them. A passing prior attempt
    /// is honoured without calling the provider again, and prior failures
    /// count against the budget.
    pub async fn run_step<R: WorkflowRepository>(
        &self,
        checkpoint: &CheckpointManager<R>,
        execution_id: Uuid,
        step: &StepDefinition,
        context: &str,
        prior: &[StepAttempt],
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepError> {
        if let Some(last) = prior.last().filter(|a| a.criteria_passed) {
            tracing::info!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt = last.attempt_number,
                "step already passed before restart"
            );
            return Ok(self.passed(step, last.clone()));
        }

        let max_attempts = step.max_attempts();
        let mut attempts: Vec<StepAttempt> = prior.to_vec();
        if attempts.len() as u32 >= max_attempts {
            return Ok(StepOutcome::Exhausted(attempts));
        }

        let model = self.resolve_model(step);
        let prompt = compose_prompt(&step.prompt, context);
        let mut attempt_number = prior.iter().map(|a| a.attempt_number).max().unwrap_or(0);

        while (attempts.len() as u32) < max_attempts {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled {
                    step_id: step.id.clone(),
                });
            }
            attempt_number += 1;

            let request = CompletionRequest {
                model: model.clone(),
                messages: vec![Message::user(prompt.clone())],
                system: None,
                max_tokens: self.settings.max_tokens,
                temperature: Some(self.settings.temperature),
            };

            let span = tracing::info_span!(
                "chat",
                gen_ai.operation.name = "chat",
                gen_ai.provider.name = self.provider.name(),
                gen_ai.request.model = model.as_str(),
                gen_ai.request.max_tokens = self.settings.max_tokens,
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt = attempt_number,
            );
            let call = self
                .call_provider(&request, cancel)
                .instrument(span)
                .await;

            let response = match call {
                Ok(response) => response,
                Err(CallError::Cancelled) => {
                    return Err(StepError::Cancelled {
                        step_id: step.id.clone(),
                    });
                }
                Err(CallError::Provider(source)) => {
                    let attempt = StepAttempt {
                        id: Uuid::now_v7(),
                        execution_id,
                        step_id: step.id.clone(),
                        attempt_number,
                        model: model.clone(),
                        prompt_sent: prompt.clone(),
                        response: None,
                        tokens_used: None,
                        criteria_passed: false,
                        failure_type: Some(FailureType::ProviderError),
                        failure_reason: Some(source.to_string()),
                        created_at: Utc::now(),
                    };
                    self.record(checkpoint, &attempt).await?;
                    tracing::error!(
                        execution_id = %execution_id,
                        step_id = step.id.as_str(),
                        attempt = attempt_number,
                        error = %source,
                        "provider call failed permanently"
                    );
                    return Err(StepError::ProviderTransport {
                        step_id: step.id.clone(),
                        attempt: attempt_number,
                        source,
                    });
                }
            };

            let verdict = evaluate(&step.criterion, &response.content);
            let attempt = StepAttempt {
                id: Uuid::now_v7(),
                execution_id,
                step_id: step.id.clone(),
                attempt_number,
                model: model.clone(),
                prompt_sent: prompt.clone(),
                response: Some(response.content),
                tokens_used: Some(response.usage.total()),
                criteria_passed: verdict.passed,
                failure_type: verdict.failure_type,
                failure_reason: verdict.failure_reason,
                created_at: Utc::now(),
            };
            self.record(checkpoint, &attempt).await?;

            if attempt.criteria_passed {
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    attempt = attempt_number,
                    "criterion passed"
                );
                return Ok(self.passed(step, attempt));
            }

            tracing::warn!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt = attempt_number,
                max_attempts,
                failure_type = ?attempt.failure_type,
                reason = attempt.failure_reason.as_deref().unwrap_or(""),
                "criterion failed"
            );
            attempts.push(attempt);
        }

        Ok(StepOutcome::Exhausted(attempts))
    }

    fn passed(&self, step: &StepDefinition, attempt: StepAttempt) -> StepOutcome {
        if step.requires_approval {
            StepOutcome::Paused(attempt)
        } else {
            StepOutcome::Advance(attempt)
        }
    }

    async fn record<R: WorkflowRepository>(
        &self,
        checkpoint: &CheckpointManager<R>,
        attempt: &StepAttempt,
    ) -> Result<(), CheckpointError> {
        checkpoint.record_attempt(attempt).await?;
        self.event_bus.publish(WorkflowEvent::AttemptRecorded {
            execution_id: attempt.execution_id,
            step_id: attempt.step_id.clone(),
            attempt_number: attempt.attempt_number,
            passed: attempt.criteria_passed,
            failure_reason: attempt.failure_reason.clone(),
        });
        Ok(())
    }

    /// One logical provider call: bounded by the call timeout, retried
    /// immediately on transient failures, abandoned on cancellation.
    async fn call_provider(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, CallError> {
        let timeout_secs = self.settings.call_timeout.as_secs();
        let mut transport_failures = 0u32;

        loop {
            let call = tokio::time::timeout(self.settings.call_timeout, self.provider.complete(request));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                outcome = call => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(timeout_secs)),
                },
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && transport_failures < self.settings.transport_retries => {
                    transport_failures += 1;
                    tracing::warn!(
                        error = %e,
                        retry = transport_failures,
                        max_retries = self.settings.transport_retries,
                        "transient provider failure, retrying"
                    );
                }
                Err(e) => return Err(CallError::Provider(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::testing::{ScriptedProvider, Reply, contains, step, text, workflow};
    use promptchain_types::workflow::{CriterionCheck, Execution};

    struct Harness {
        checkpoint: CheckpointManager<InMemoryWorkflowRepository>,
        execution_id: Uuid,
    }

    async fn harness(step_def: &StepDefinition) -> Harness {
        let checkpoint = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let def = workflow("runner", vec![step_def.clone()]);
        let execution = Execution::new(&def, def.ordered_steps());
        checkpoint.create_execution(&execution).await.unwrap();
        Harness {
            checkpoint,
            execution_id: execution.id,
        }
    }

    fn runner(script: Vec<Reply>) -> StepRunner<ScriptedProvider> {
        let settings = StepRunnerSettings {
            call_timeout: Duration::from_millis(200),
            ..StepRunnerSettings::default()
        };
        StepRunner::new(ScriptedProvider::new(script), settings, EventBus::new(64))
    }

    async fn recorded(h: &Harness) -> Vec<StepAttempt> {
        h.checkpoint
            .load_execution(h.execution_id)
            .await
            .unwrap()
            .attempts
    }

    #[tokio::test]
    async fn passes_on_first_attempt() {
        let s = step("a", 0, contains("OK"), 2);
        let h = harness(&s).await;
        let runner = runner(vec![text("all OK")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();

        let StepOutcome::Advance(attempt) = outcome else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(attempt.attempt_number, 1);
        assert!(attempt.criteria_passed);
        assert_eq!(attempt.tokens_used, Some(100));
        assert_eq!(recorded(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn retries_with_fresh_call_and_same_prompt() {
        let s = step("a", 0, contains("OK"), 3);
        let h = harness(&s).await;
        let runner = runner(vec![text("no"), text("still no"), text("OK now")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "prior output", &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Advance(ref a) if a.attempt_number == 3));
        let requests = runner.provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.messages[0].content == requests[0].messages[0].content));
        assert!(requests[0].messages[0].content.contains("prior output"));

        let history = recorded(&h).await;
        let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(!history[0].criteria_passed);
        assert_eq!(history[0].failure_type, Some(FailureType::CriteriaFailed));
    }

    #[tokio::test]
    async fn exhausts_after_max_retries_plus_one() {
        let s = step("a", 0, contains("OK"), 2);
        let h = harness(&s).await;
        let runner = runner(vec![text("FAIL")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();

        let StepOutcome::Exhausted(attempts) = outcome else {
            panic!("expected exhausted");
        };
        assert_eq!(attempts.len(), 3);
        assert_eq!(runner.provider.calls(), 3);
        assert!(attempts.last().unwrap().failure_reason.is_some());
        assert_eq!(recorded(&h).await.len(), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let s = step("a", 0, CriterionCheck::ValidJson, 0);
        let h = harness(&s).await;
        let runner = runner(vec![text("not json")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();

        let StepOutcome::Exhausted(attempts) = outcome else {
            panic!("expected exhausted");
        };
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].failure_type, Some(FailureType::ParseError));
    }

    #[tokio::test]
    async fn approval_step_pauses_after_pass() {
        let mut s = step("gate", 0, contains("OK"), 1);
        s.requires_approval = true;
        let h = harness(&s).await;
        let runner = runner(vec![text("OK")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Paused(_)));
    }

    #[tokio::test]
    async fn transient_errors_do_not_consume_criteria_budget() {
        let s = step("a", 0, contains("OK"), 0);
        let h = harness(&s).await;
        let runner = runner(vec![
            Reply::Error(LlmError::Overloaded("busy".into())),
            Reply::Error(LlmError::Transport("reset".into())),
            text("OK"),
        ]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Advance(ref a) if a.attempt_number == 1));
        assert_eq!(runner.provider.calls(), 3);
        assert_eq!(recorded(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn transport_retries_exhausted_escalates() {
        let s = step("a", 0, contains("OK"), 3);
        let h = harness(&s).await;
        let runner = runner(vec![Reply::Error(LlmError::RateLimited {
            retry_after_ms: None,
        })]);

        let err = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::ProviderTransport { attempt: 1, .. }));
        // One call plus two transport retries.
        assert_eq!(runner.provider.calls(), 3);
        let history = recorded(&h).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].failure_type, Some(FailureType::ProviderError));
        assert!(history[0].response.is_none());
    }

    #[tokio::test]
    async fn non_transient_error_fails_without_retry() {
        let s = step("a", 0, contains("OK"), 3);
        let h = harness(&s).await;
        let runner = runner(vec![Reply::Error(LlmError::AuthenticationFailed)]);

        let err = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StepError::ProviderTransport {
                source: LlmError::AuthenticationFailed,
                ..
            }
        ));
        assert_eq!(runner.provider.calls(), 1);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_transient() {
        let s = step("a", 0, contains("OK"), 0);
        let h = harness(&s).await;
        let runner = runner(vec![Reply::Hang, text("OK")]);

        let outcome = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Advance(_)));
        assert_eq!(runner.provider.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_call() {
        let s = step("a", 0, contains("OK"), 0);
        let h = harness(&s).await;
        let settings = StepRunnerSettings {
            call_timeout: Duration::from_secs(60),
            ..StepRunnerSettings::default()
        };
        let runner = StepRunner::new(
            ScriptedProvider::always(Reply::Hang),
            settings,
            EventBus::new(8),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled { .. }));
        assert!(recorded(&h).await.is_empty());
    }

    #[tokio::test]
    async fn prior_attempts_continue_numbering_and_share_budget() {
        let s = step("a", 0, contains("OK"), 2);
        let h = harness(&s).await;

        // An earlier controller recorded two failures before stopping.
        let first = runner(vec![text("bad")]);
        let _ = first
            .run_step(&h.checkpoint, h.execution_id, &step("a", 0, contains("OK"), 1), "", &[], &CancellationToken::new())
            .await
            .unwrap();
        let prior = recorded(&h).await;
        assert_eq!(prior.len(), 2);

        let second = runner(vec![text("bad again")]);
        let outcome = second
            .run_step(&h.checkpoint, h.execution_id, &s, "", &prior, &CancellationToken::new())
            .await
            .unwrap();

        let StepOutcome::Exhausted(attempts) = outcome else {
            panic!("expected exhausted");
        };
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].attempt_number, 3);
        assert_eq!(second.provider.calls(), 1);
    }

    #[tokio::test]
    async fn passing_prior_attempt_is_not_rerun() {
        let s = step("a", 0, contains("OK"), 2);
        let h = harness(&s).await;
        let first = runner(vec![text("OK")]);
        first
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();
        let prior = recorded(&h).await;

        let second = runner(vec![text("OK")]);
        let outcome = second
            .run_step(&h.checkpoint, h.execution_id, &s, "", &prior, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Advance(_)));
        assert_eq!(second.provider.calls(), 0);
    }

    #[tokio::test]
    async fn auto_model_resolves_by_criterion() {
        let runner = runner(vec![]);
        let mut json_step = step("a", 0, CriterionCheck::ValidJson, 0);
        json_step.model = "auto".to_string();
        let mut text_step = step("b", 1, contains("x"), 0);
        text_step.model = "AUTO".to_string();

        assert_eq!(runner.resolve_model(&json_step), "kimi-k2-instruct-0905");
        assert_eq!(runner.resolve_model(&text_step), "kimi-k2p5");
        assert_eq!(runner.resolve_model(&step("c", 2, contains("x"), 0)), "kimi-k2p5");
    }

    #[tokio::test]
    async fn attempts_are_published_on_the_bus() {
        let s = step("a", 0, contains("OK"), 1);
        let h = harness(&s).await;
        let runner = runner(vec![text("no"), text("OK")]);
        let mut rx = runner.event_bus.subscribe();

        runner
            .run_step(&h.checkpoint, h.execution_id, &s, "", &[], &CancellationToken::new())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WorkflowEvent::AttemptRecorded { passed: false, attempt_number: 1, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, WorkflowEvent::AttemptRecorded { passed: true, attempt_number: 2, .. }));
    }
}
