//! Context propagation between steps.
//!
//! The only thing a step sees of the chain so far is the response of the
//! most recent passing attempt of the step before it. Failed attempts never
//! leak forward.

use promptchain_types::workflow::{ContextStrategy, StepAttempt};

/// Default character limit for `ContextStrategy::TruncateChars`.
pub const DEFAULT_TRUNCATE_CHARS: usize = 4096;

/// Appended when `TruncateChars` cut the source text.
pub const TRUNCATION_MARKER: &str = "\n\n[... truncated]";

/// Separates the step prompt from the forwarded context.
const CONTEXT_HEADER: &str = "\n\n--- Context from previous step ---\n";

/// Builds the context string handed to the next step.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    truncate_chars: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TRUNCATE_CHARS)
    }
}

impl ContextBuilder {
    pub fn new(truncate_chars: usize) -> Self {
        Self { truncate_chars }
    }

    /// Context for the step that follows `previous_step_id`, shaped by that
    /// next step's `strategy`.
    ///
    /// Returns an empty string for the first step or when the previous step
    /// has no passing attempt in `history`.
    pub fn build(
        &self,
        history: &[StepAttempt],
        previous_step_id: Option<&str>,
        strategy: ContextStrategy,
    ) -> String {
        let Some(previous) = previous_step_id else {
            return String::new();
        };
        let source = history
            .iter()
            .rev()
            .find(|a| a.step_id == previous && a.criteria_passed)
            .and_then(|a| a.response.as_deref())
            .unwrap_or("");

        match strategy {
            ContextStrategy::Full => source.to_string(),
            ContextStrategy::TruncateChars => truncate_chars(source, self.truncate_chars),
        }
    }
}

/// Keep the first `limit` characters of `text`, cutting on a `char` boundary
/// and appending `TRUNCATION_MARKER` when anything was dropped.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATION_MARKER);
            out
        }
    }
}

/// The prompt actually sent: the step prompt, followed by the forwarded
/// context under a header when there is any.
pub fn compose_prompt(prompt: &str, context: &str) -> String {
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}{CONTEXT_HEADER}{context}")
    }
}
