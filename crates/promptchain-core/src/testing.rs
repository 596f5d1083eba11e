//! Shared fixtures for engine tests: a scripted provider and step builders.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use promptchain_types::llm::{CompletionRequest, CompletionResponse, LlmError, Usage};
use promptchain_types::workflow::{
    CompletionCriterion, ContextStrategy, CriterionCheck, StepDefinition, WorkflowDefinition,
};
use uuid::Uuid;

use crate::llm::provider::LlmProvider;

/// One scripted provider reaction.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Error(LlmError),
    /// Never answers within any reasonable timeout.
    Hang,
    /// Answers with the text once the delay has passed.
    Slow(Duration, String),
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

pub fn slow(millis: u64, s: &str) -> Reply {
    Reply::Slow(Duration::from_millis(millis), s.to_string())
}

/// Provider that plays back a fixed script and records every request.
///
/// Once the script runs out it keeps answering with the last reply.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    tokens_per_reply: u32,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            tokens_per_reply: 100,
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self::new(vec![reply])
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_reply(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match script.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last
                .clone()
                .unwrap_or_else(|| Reply::Error(LlmError::InvalidRequest("empty script".into()))),
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, LlmError>> + Send {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.next_reply();
        let model = request.model.clone();
        let tokens = self.tokens_per_reply;
        async move {
            let content = match reply {
                Reply::Text(content) => content,
                Reply::Slow(delay, content) => {
                    tokio::time::sleep(delay).await;
                    content
                }
                Reply::Error(e) => return Err(e),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Err(LlmError::Timeout(3600));
                }
            };
            Ok(CompletionResponse {
                id: format!("resp-{}", Uuid::now_v7()),
                content,
                model,
                finish_reason: Some("stop".to_string()),
                usage: Usage {
                    input_tokens: tokens / 2,
                    output_tokens: tokens / 2,
                },
            })
        }
    }
}

pub fn step(id: &str, order_index: i64, check: CriterionCheck, max_retries: u32) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        order_index,
        model: "kimi-k2p5".to_string(),
        prompt: format!("Do {id}"),
        criterion: CompletionCriterion::new(check).with_max_retries(max_retries),
        context_strategy: ContextStrategy::Full,
        requires_approval: false,
    }
}

pub fn contains(value: &str) -> CriterionCheck {
    CriterionCheck::ContainsString {
        value: value.to_string(),
    }
}

pub fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.to_string(),
        description: None,
        steps,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
